//! Anomaly detectors.
//!
//! Detectors are pure functions over a [`DetectionContext`] and the activity
//! config: no store access, no clocks, no hidden state. Anything stateful
//! (burst windows, token comparisons, batch sizes) is computed by the engine
//! beforehand and passed in. The registry is a list consulted in order; each
//! detector contributes at most one anomaly per transition.

use chrono::{DateTime, Utc};
use relay_common::{anomaly_types, ActivityAction, Anomaly, AnomalySeverity, Message};
use relay_config::ActivityConfig;
use serde_json::json;

/// Facts about one transition, assembled by the engine.
pub struct DetectionContext<'a> {
    pub action: ActivityAction,
    pub message: Option<&'a Message>,
    pub consumer_id: Option<&'a str>,
    pub error_reason: Option<&'a str>,
    pub now: DateTime<Utc>,
    /// Pre-computed, action-specific facts.
    pub extra: ContextExtra,
}

/// Action-specific facts; unset fields simply keep detectors quiet.
#[derive(Debug, Clone, Default)]
pub struct ContextExtra {
    /// Size of the batch for bulk operations.
    pub batch_size: Option<usize>,
    /// Dequeues by this consumer inside the sliding burst window.
    pub burst_count: Option<usize>,
    /// Presented lock token did not match the stored one.
    pub lock_mismatch: bool,
    /// Attempts left before dead-lettering (nack path).
    pub attempts_remaining: Option<i32>,
    /// This transition ends in `dead`.
    pub to_dead: bool,
    /// This transition returned the message to `queued`.
    pub requeued: bool,
    /// dequeued -> acknowledged duration.
    pub processing_ms: Option<i64>,
    /// Resolved ack timeout for the message, in seconds.
    pub effective_ack_timeout: Option<i64>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(action: ActivityAction, message: Option<&'a Message>) -> Self {
        Self {
            action,
            message,
            consumer_id: None,
            error_reason: None,
            now: Utc::now(),
            extra: ContextExtra::default(),
        }
    }
}

/// One anomaly detector. Implementations must be pure.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly>;
}

/// Ordered list of detectors; the first anomaly is the one surfaced on the
/// activity row, the rest are still persisted.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// The built-in set, in surfacing order.
    pub fn builtin() -> Self {
        Self::new(vec![
            Box::new(LockStolen),
            Box::new(DlqMovement),
            Box::new(NearDlq),
            Box::new(ZombieMessage),
            Box::new(LargePayload),
            Box::new(LongProcessing),
            Box::new(FlashMessage),
            Box::new(BurstDequeue),
            Box::new(BulkEnqueue),
            Box::new(BulkMove),
            Box::new(BulkDelete),
            Box::new(QueueCleared),
            Box::new(Requeued),
        ])
    }

    /// Run every detector against the context.
    pub fn detect_all(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Vec<Anomaly> {
        self.detectors
            .iter()
            .filter_map(|d| d.detect(ctx, config))
            .collect()
    }
}

// ============================================================================
// Built-in detectors
// ============================================================================

/// Message dequeued almost immediately after enqueue.
struct FlashMessage;

impl Detector for FlashMessage {
    fn name(&self) -> &'static str {
        anomaly_types::FLASH_MESSAGE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Dequeue {
            return None;
        }
        let message = ctx.message?;
        let age_ms = (ctx.now - message.created_at).num_milliseconds();
        if age_ms < config.flash_message_threshold_ms {
            Some(Anomaly::new(
                anomaly_types::FLASH_MESSAGE,
                AnomalySeverity::Info,
                json!({ "age_ms": age_ms, "threshold_ms": config.flash_message_threshold_ms }),
            ))
        } else {
            None
        }
    }
}

struct LargePayload;

impl Detector for LargePayload {
    fn name(&self) -> &'static str {
        anomaly_types::LARGE_PAYLOAD
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Enqueue {
            return None;
        }
        let message = ctx.message?;
        if message.payload_size >= config.large_payload_threshold_bytes {
            Some(Anomaly::new(
                anomaly_types::LARGE_PAYLOAD,
                AnomalySeverity::Warning,
                json!({
                    "payload_size": message.payload_size,
                    "threshold_bytes": config.large_payload_threshold_bytes
                }),
            ))
        } else {
            None
        }
    }
}

struct LongProcessing;

impl Detector for LongProcessing {
    fn name(&self) -> &'static str {
        anomaly_types::LONG_PROCESSING
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Ack {
            return None;
        }
        let processing_ms = ctx.extra.processing_ms?;
        if processing_ms >= config.long_processing_threshold_ms {
            Some(Anomaly::new(
                anomaly_types::LONG_PROCESSING,
                AnomalySeverity::Warning,
                json!({
                    "processing_ms": processing_ms,
                    "threshold_ms": config.long_processing_threshold_ms
                }),
            ))
        } else {
            None
        }
    }
}

/// A completion call presented a token that is not the stored one: some
/// other worker owns the message now.
struct LockStolen;

impl Detector for LockStolen {
    fn name(&self) -> &'static str {
        anomaly_types::LOCK_STOLEN
    }

    fn detect(&self, ctx: &DetectionContext<'_>, _config: &ActivityConfig) -> Option<Anomaly> {
        let relevant = matches!(
            ctx.action,
            ActivityAction::Ack | ActivityAction::Nack | ActivityAction::Touch
        );
        if relevant && ctx.extra.lock_mismatch {
            Some(Anomaly::new(
                anomaly_types::LOCK_STOLEN,
                AnomalySeverity::Critical,
                json!({ "consumer_id": ctx.consumer_id }),
            ))
        } else {
            None
        }
    }
}

struct NearDlq;

impl Detector for NearDlq {
    fn name(&self) -> &'static str {
        anomaly_types::NEAR_DLQ
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Nack {
            return None;
        }
        let remaining = ctx.extra.attempts_remaining?;
        if remaining > 0 && remaining <= config.near_dlq_threshold {
            Some(Anomaly::new(
                anomaly_types::NEAR_DLQ,
                AnomalySeverity::Warning,
                json!({ "attempts_remaining": remaining }),
            ))
        } else {
            None
        }
    }
}

struct DlqMovement;

impl Detector for DlqMovement {
    fn name(&self) -> &'static str {
        anomaly_types::DLQ_MOVEMENT
    }

    fn detect(&self, ctx: &DetectionContext<'_>, _config: &ActivityConfig) -> Option<Anomaly> {
        let relevant = matches!(
            ctx.action,
            ActivityAction::Nack | ActivityAction::Move | ActivityAction::Timeout
        );
        if relevant && ctx.extra.to_dead {
            Some(Anomaly::new(
                anomaly_types::DLQ_MOVEMENT,
                AnomalySeverity::Critical,
                json!({
                    "attempt_count": ctx.message.map(|m| m.attempt_count),
                    "error": ctx.error_reason
                }),
            ))
        } else {
            None
        }
    }
}

/// Held in `processing` far past the ack deadline before the sweeper caught
/// it: the holder likely died without nacking.
struct ZombieMessage;

impl Detector for ZombieMessage {
    fn name(&self) -> &'static str {
        anomaly_types::ZOMBIE_MESSAGE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Timeout {
            return None;
        }
        let message = ctx.message?;
        let dequeued_at = message.dequeued_at?;
        let ack_timeout = ctx.extra.effective_ack_timeout?;
        let held_seconds = (ctx.now - dequeued_at).num_seconds();
        if held_seconds >= config.zombie_threshold_multiplier * ack_timeout {
            Some(Anomaly::new(
                anomaly_types::ZOMBIE_MESSAGE,
                AnomalySeverity::Warning,
                json!({
                    "held_seconds": held_seconds,
                    "ack_timeout_seconds": ack_timeout,
                    "multiplier": config.zombie_threshold_multiplier
                }),
            ))
        } else {
            None
        }
    }
}

struct BurstDequeue;

impl Detector for BurstDequeue {
    fn name(&self) -> &'static str {
        anomaly_types::BURST_DEQUEUE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Dequeue {
            return None;
        }
        let count = ctx.extra.burst_count?;
        if count >= config.burst_threshold_count {
            Some(Anomaly::new(
                anomaly_types::BURST_DEQUEUE,
                AnomalySeverity::Warning,
                json!({
                    "window_count": count,
                    "window_seconds": config.burst_threshold_seconds,
                    "consumer_id": ctx.consumer_id
                }),
            ))
        } else {
            None
        }
    }
}

struct BulkEnqueue;

impl Detector for BulkEnqueue {
    fn name(&self) -> &'static str {
        anomaly_types::BULK_ENQUEUE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Enqueue {
            return None;
        }
        let size = ctx.extra.batch_size?;
        if size >= config.bulk_operation_threshold {
            Some(Anomaly::new(
                anomaly_types::BULK_ENQUEUE,
                AnomalySeverity::Info,
                json!({ "batch_size": size }),
            ))
        } else {
            None
        }
    }
}

struct BulkDelete;

impl Detector for BulkDelete {
    fn name(&self) -> &'static str {
        anomaly_types::BULK_DELETE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        let relevant = matches!(ctx.action, ActivityAction::Delete | ActivityAction::Clear);
        if !relevant {
            return None;
        }
        let size = ctx.extra.batch_size?;
        if size >= config.bulk_operation_threshold {
            Some(Anomaly::new(
                anomaly_types::BULK_DELETE,
                AnomalySeverity::Warning,
                json!({ "batch_size": size }),
            ))
        } else {
            None
        }
    }
}

struct BulkMove;

impl Detector for BulkMove {
    fn name(&self) -> &'static str {
        anomaly_types::BULK_MOVE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action != ActivityAction::Move {
            return None;
        }
        let size = ctx.extra.batch_size?;
        if size >= config.bulk_operation_threshold {
            Some(Anomaly::new(
                anomaly_types::BULK_MOVE,
                AnomalySeverity::Warning,
                json!({ "batch_size": size }),
            ))
        } else {
            None
        }
    }
}

struct QueueCleared;

impl Detector for QueueCleared {
    fn name(&self) -> &'static str {
        anomaly_types::QUEUE_CLEARED
    }

    fn detect(&self, ctx: &DetectionContext<'_>, _config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action == ActivityAction::Clear {
            Some(Anomaly::new(
                anomaly_types::QUEUE_CLEARED,
                AnomalySeverity::Warning,
                json!({ "count": ctx.extra.batch_size }),
            ))
        } else {
            None
        }
    }
}

/// Timeout recovery returned the message to the queue.
struct Requeued;

impl Detector for Requeued {
    fn name(&self) -> &'static str {
        anomaly_types::REQUEUE
    }

    fn detect(&self, ctx: &DetectionContext<'_>, _config: &ActivityConfig) -> Option<Anomaly> {
        if ctx.action == ActivityAction::Timeout && ctx.extra.requeued {
            Some(Anomaly::new(
                anomaly_types::REQUEUE,
                AnomalySeverity::Info,
                json!({ "attempt_count": ctx.message.map(|m| m.attempt_count) }),
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::MessageStatus;

    fn test_message() -> Message {
        Message {
            id: "0000000000001".to_string(),
            queue_name: "default".to_string(),
            message_type: "job".to_string(),
            payload: json!({}),
            priority: 0,
            status: MessageStatus::Processing,
            attempt_count: 1,
            max_attempts: None,
            ack_timeout_seconds: None,
            lock_token: Some("token".to_string()),
            locked_until: None,
            consumer_id: None,
            created_at: Utc::now(),
            dequeued_at: Some(Utc::now()),
            acknowledged_at: None,
            last_error: None,
            payload_size: 2,
        }
    }

    fn config() -> ActivityConfig {
        ActivityConfig::default()
    }

    #[test]
    fn test_flash_message_fires_on_fresh_dequeue() {
        let message = test_message();
        let ctx = DetectionContext::new(ActivityAction::Dequeue, Some(&message));
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::FLASH_MESSAGE));
    }

    #[test]
    fn test_flash_message_quiet_on_old_message() {
        let mut message = test_message();
        message.created_at = Utc::now() - chrono::Duration::seconds(60);
        let ctx = DetectionContext::new(ActivityAction::Dequeue, Some(&message));
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_large_payload_threshold() {
        let mut message = test_message();
        message.created_at = Utc::now() - chrono::Duration::seconds(60);
        message.payload_size = 2 * 1024 * 1024;
        let ctx = DetectionContext::new(ActivityAction::Enqueue, Some(&message));
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, anomaly_types::LARGE_PAYLOAD);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Warning);
    }

    #[test]
    fn test_lock_stolen_is_critical() {
        let message = test_message();
        let mut ctx = DetectionContext::new(ActivityAction::Ack, Some(&message));
        ctx.extra.lock_mismatch = true;
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert_eq!(anomalies[0].anomaly_type, anomaly_types::LOCK_STOLEN);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Critical);
    }

    #[test]
    fn test_near_dlq_only_when_attempts_remain() {
        let message = test_message();
        let mut ctx = DetectionContext::new(ActivityAction::Nack, Some(&message));
        ctx.extra.attempts_remaining = Some(1);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::NEAR_DLQ));

        ctx.extra.attempts_remaining = Some(0);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(!anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::NEAR_DLQ));
    }

    #[test]
    fn test_dlq_movement_on_terminal_nack() {
        let message = test_message();
        let mut ctx = DetectionContext::new(ActivityAction::Nack, Some(&message));
        ctx.extra.to_dead = true;
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert_eq!(anomalies[0].anomaly_type, anomaly_types::DLQ_MOVEMENT);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Critical);
    }

    #[test]
    fn test_zombie_requires_multiplied_timeout() {
        let mut message = test_message();
        message.dequeued_at = Some(Utc::now() - chrono::Duration::seconds(120));
        let mut ctx = DetectionContext::new(ActivityAction::Timeout, Some(&message));
        ctx.extra.effective_ack_timeout = Some(30);
        ctx.extra.requeued = true;
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::ZOMBIE_MESSAGE));

        // Held for just over one timeout: requeue only, no zombie.
        message.dequeued_at = Some(Utc::now() - chrono::Duration::seconds(35));
        let mut ctx = DetectionContext::new(ActivityAction::Timeout, Some(&message));
        ctx.extra.effective_ack_timeout = Some(30);
        ctx.extra.requeued = true;
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(!anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::ZOMBIE_MESSAGE));
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::REQUEUE));
    }

    #[test]
    fn test_burst_dequeue_window() {
        let message = test_message();
        let mut ctx = DetectionContext::new(ActivityAction::Dequeue, Some(&message));
        ctx.extra.burst_count = Some(50);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::BURST_DEQUEUE));
    }

    #[test]
    fn test_bulk_thresholds() {
        let mut ctx = DetectionContext::new(ActivityAction::Enqueue, None);
        ctx.extra.batch_size = Some(100);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert_eq!(anomalies[0].anomaly_type, anomaly_types::BULK_ENQUEUE);

        let mut ctx = DetectionContext::new(ActivityAction::Move, None);
        ctx.extra.batch_size = Some(99);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_queue_cleared_always_fires() {
        let mut ctx = DetectionContext::new(ActivityAction::Clear, None);
        ctx.extra.batch_size = Some(3);
        let anomalies = DetectorRegistry::builtin().detect_all(&ctx, &config());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == anomaly_types::QUEUE_CLEARED
                && a.severity == AnomalySeverity::Warning));
    }
}
