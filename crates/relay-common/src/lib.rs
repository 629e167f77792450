use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

pub mod error;
pub mod logging;
pub mod tsid;

pub use error::{RelayError, StoreError};

pub type Result<T> = std::result::Result<T, RelayError>;

// ============================================================================
// Message Lifecycle
// ============================================================================

/// Lifecycle status of a message.
///
/// `Dead`, `Acknowledged` and `Archived` are terminal: nothing transitions
/// out of them except an explicit admin move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Processing,
    Acknowledged,
    Dead,
    Archived,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Queued,
        MessageStatus::Processing,
        MessageStatus::Acknowledged,
        MessageStatus::Dead,
        MessageStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Processing => "processing",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Dead => "dead",
            MessageStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(MessageStatus::Queued),
            "processing" => Some(MessageStatus::Processing),
            "acknowledged" => Some(MessageStatus::Acknowledged),
            "dead" => Some(MessageStatus::Dead),
            "archived" => Some(MessageStatus::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Acknowledged | MessageStatus::Dead | MessageStatus::Archived
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work owned by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub queue_name: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: MessageStatus,
    pub attempt_count: i32,
    /// Per-message override; queue default applies when None.
    pub max_attempts: Option<i32>,
    /// Per-message override; queue default applies when None.
    pub ack_timeout_seconds: Option<i64>,
    /// Non-null only while `status == Processing`; rotated on every claim.
    pub lock_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub consumer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub payload_size: i64,
}

impl Message {
    /// Per-message ack timeout if set, else the queue default.
    pub fn effective_ack_timeout(&self, queue_default: i64) -> i64 {
        self.ack_timeout_seconds.unwrap_or(queue_default)
    }

    /// Per-message attempt cap if set, else the queue default.
    pub fn effective_max_attempts(&self, queue_default: i32) -> i32 {
        self.max_attempts.unwrap_or(queue_default)
    }
}

/// Producer-supplied fields for a single enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    /// Target queue; the configured default queue applies when None.
    #[serde(default)]
    pub queue: Option<String>,
}

/// Mint a fencing token: 128 random bits, collision-resistant rendering.
pub fn mint_lock_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Queues
// ============================================================================

/// Storage class of a queue. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Standard,
    Unlogged,
    Partitioned,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Standard => "standard",
            QueueType::Unlogged => "unlogged",
            QueueType::Partitioned => "partitioned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(QueueType::Standard),
            "unlogged" => Some(QueueType::Unlogged),
            "partitioned" => Some(QueueType::Partitioned),
            _ => None,
        }
    }
}

impl Default for QueueType {
    fn default() -> Self {
        QueueType::Standard
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named queue and its delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: i64,
    pub max_attempts: i32,
    pub partition_interval_seconds: Option<i64>,
    pub retention_interval_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a queue; unset policies fall back to the
/// engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewQueue {
    pub name: String,
    #[serde(default)]
    pub queue_type: QueueType,
    #[serde(default)]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub partition_interval_seconds: Option<i64>,
    #[serde(default)]
    pub retention_interval_seconds: Option<i64>,
}

/// Mutable queue policy; `queue_type` is deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueUpdate {
    #[serde(default)]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub retention_interval_seconds: Option<i64>,
}

/// Row counts by status for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueueCounts {
    pub queued: i64,
    pub processing: i64,
    pub acknowledged: i64,
    pub dead: i64,
    pub archived: i64,
}

impl QueueCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.acknowledged + self.dead + self.archived
    }

    pub fn set(&mut self, status: MessageStatus, count: i64) {
        match status {
            MessageStatus::Queued => self.queued = count,
            MessageStatus::Processing => self.processing = count,
            MessageStatus::Acknowledged => self.acknowledged = count,
            MessageStatus::Dead => self.dead = count,
            MessageStatus::Archived => self.archived = count,
        }
    }
}

// ============================================================================
// Activity Log
// ============================================================================

/// Audited state transitions. One row per observable transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Enqueue,
    Dequeue,
    Ack,
    Nack,
    Requeue,
    Timeout,
    Touch,
    Move,
    Dlq,
    Delete,
    Clear,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::Enqueue => "enqueue",
            ActivityAction::Dequeue => "dequeue",
            ActivityAction::Ack => "ack",
            ActivityAction::Nack => "nack",
            ActivityAction::Requeue => "requeue",
            ActivityAction::Timeout => "timeout",
            ActivityAction::Touch => "touch",
            ActivityAction::Move => "move",
            ActivityAction::Dlq => "dlq",
            ActivityAction::Delete => "delete",
            ActivityAction::Clear => "clear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueue" => Some(ActivityAction::Enqueue),
            "dequeue" => Some(ActivityAction::Dequeue),
            "ack" => Some(ActivityAction::Ack),
            "nack" => Some(ActivityAction::Nack),
            "requeue" => Some(ActivityAction::Requeue),
            "timeout" => Some(ActivityAction::Timeout),
            "touch" => Some(ActivityAction::Touch),
            "move" => Some(ActivityAction::Move),
            "dlq" => Some(ActivityAction::Dlq),
            "delete" => Some(ActivityAction::Delete),
            "clear" => Some(ActivityAction::Clear),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub log_id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: ActivityAction,
    pub message_id: Option<String>,
    pub queue_name: String,
    pub consumer_id: Option<String>,
    pub message_type: Option<String>,
    /// Action-specific context: batch id, source/dest queue, error reason,
    /// duration, attempt count.
    pub context: serde_json::Value,
    pub anomaly: Option<Anomaly>,
}

// ============================================================================
// Anomalies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Info => "info",
            AnomalySeverity::Warning => "warning",
            AnomalySeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AnomalySeverity::Info),
            "warning" => Some(AnomalySeverity::Warning),
            "critical" => Some(AnomalySeverity::Critical),
            _ => None,
        }
    }
}

/// A typed observation attached to an activity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: AnomalySeverity,
    pub details: serde_json::Value,
}

impl Anomaly {
    pub fn new(
        anomaly_type: impl Into<String>,
        severity: AnomalySeverity,
        details: serde_json::Value,
    ) -> Self {
        Self {
            anomaly_type: anomaly_type.into(),
            severity,
            details,
        }
    }
}

/// A persisted anomaly, optionally attached to an activity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub anomaly_id: i64,
    pub log_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: AnomalySeverity,
    pub message_id: Option<String>,
    pub queue_name: Option<String>,
    pub consumer_id: Option<String>,
    pub details: serde_json::Value,
}

/// Aggregate view returned alongside anomaly listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub total: i64,
    pub by_type: HashMap<String, i64>,
    pub by_severity: HashMap<String, i64>,
}

/// Built-in anomaly type names.
pub mod anomaly_types {
    pub const FLASH_MESSAGE: &str = "flash_message";
    pub const LARGE_PAYLOAD: &str = "large_payload";
    pub const LONG_PROCESSING: &str = "long_processing";
    pub const LOCK_STOLEN: &str = "lock_stolen";
    pub const NEAR_DLQ: &str = "near_dlq";
    pub const DLQ_MOVEMENT: &str = "dlq_movement";
    pub const ZOMBIE_MESSAGE: &str = "zombie_message";
    pub const BURST_DEQUEUE: &str = "burst_dequeue";
    pub const BULK_ENQUEUE: &str = "bulk_enqueue";
    pub const BULK_DELETE: &str = "bulk_delete";
    pub const BULK_MOVE: &str = "bulk_move";
    pub const QUEUE_CLEARED: &str = "queue_cleared";
    pub const REQUEUE: &str = "requeue";
}

// ============================================================================
// Consumer Statistics
// ============================================================================

/// Derived per-consumer counters, updated on every dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub consumer_id: String,
    pub total_dequeued: i64,
    pub last_dequeue_at: Option<DateTime<Utc>>,
    /// Anomaly type -> occurrence count.
    pub anomaly_counts: HashMap<String, i64>,
}

// ============================================================================
// Change Events
// ============================================================================

/// Coarse-grained change event kinds published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Enqueue,
    Dequeue,
    Ack,
    Nack,
    Requeue,
    Timeout,
    Move,
    Delete,
    Clear,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Enqueue => "enqueue",
            EventType::Dequeue => "dequeue",
            EventType::Ack => "ack",
            EventType::Nack => "nack",
            EventType::Requeue => "requeue",
            EventType::Timeout => "timeout",
            EventType::Move => "move",
            EventType::Delete => "delete",
            EventType::Clear => "clear",
        }
    }
}

/// One change event. `timestamp` serializes as integer seconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub queue: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl QueueEvent {
    pub fn new(event_type: EventType, queue: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            queue: queue.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Counts-only variant for unauthenticated subscribers.
    pub fn redacted(&self) -> Self {
        let count = self
            .payload
            .get("count")
            .cloned()
            .unwrap_or(serde_json::Value::from(1));
        Self {
            event_type: self.event_type,
            queue: self.queue.clone(),
            timestamp: self.timestamp,
            payload: serde_json::json!({ "count": count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in MessageStatus::ALL {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!MessageStatus::Queued.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(MessageStatus::Acknowledged.is_terminal());
        assert!(MessageStatus::Dead.is_terminal());
        assert!(MessageStatus::Archived.is_terminal());
    }

    #[test]
    fn test_effective_overrides() {
        let mut message = Message {
            id: "0000000000001".to_string(),
            queue_name: "default".to_string(),
            message_type: "job".to_string(),
            payload: serde_json::json!({}),
            priority: 0,
            status: MessageStatus::Queued,
            attempt_count: 0,
            max_attempts: None,
            ack_timeout_seconds: None,
            lock_token: None,
            locked_until: None,
            consumer_id: None,
            created_at: Utc::now(),
            dequeued_at: None,
            acknowledged_at: None,
            last_error: None,
            payload_size: 2,
        };

        assert_eq!(message.effective_ack_timeout(30), 30);
        assert_eq!(message.effective_max_attempts(3), 3);

        message.ack_timeout_seconds = Some(120);
        message.max_attempts = Some(7);
        assert_eq!(message.effective_ack_timeout(30), 120);
        assert_eq!(message.effective_max_attempts(3), 7);
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        let a = mint_lock_token();
        let b = mint_lock_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_event_serializes_epoch_seconds() {
        let event = QueueEvent::new(EventType::Enqueue, "default", serde_json::json!({"id": "x"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "enqueue");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_event_redaction_keeps_counts_only() {
        let event = QueueEvent::new(
            EventType::Enqueue,
            "default",
            serde_json::json!({"id": "secret", "count": 4}),
        );
        let redacted = event.redacted();
        assert_eq!(redacted.payload, serde_json::json!({"count": 4}));
    }
}
