//! Completion engine: `ack`, `nack`, `touch`.
//!
//! Every operation validates the presented lock token against the stored one
//! inside the transaction that applies the transition. A mismatch makes no
//! state change: the transaction rolls back, a `lock_stolen` anomaly is
//! recorded out of band, and the caller gets `LockLost`.

use relay_common::{
    ActivityAction, Anomaly, EventType, Message, MessageStatus, QueueEvent, RelayError, Result,
};
use serde_json::json;
use sqlx::{Postgres, Transaction};
use tracing::{debug, warn};

use crate::activity::{record, ActivityEntry};
use crate::detectors::DetectionContext;
use crate::row::message_from_row;
use crate::{broker_metrics, stats, Engine, MESSAGE_COLS};

/// Outcome of locating and fencing a processing row.
enum FencedRow {
    Held { table: &'static str, message: Message },
    Mismatch { message: Message },
    Missing,
}

impl Engine {
    /// Acknowledge a message, consuming the lock.
    pub async fn ack(&self, message_id: &str, lock_token: &str) -> Result<Message> {
        relay_store::with_tx_retry("ack", || self.ack_once(message_id, lock_token)).await
    }

    async fn ack_once(&self, message_id: &str, lock_token: &str) -> Result<Message> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let table = match self.fence(&mut tx, message_id, lock_token).await? {
            FencedRow::Held { table, .. } => table,
            FencedRow::Mismatch { message } => {
                drop(tx);
                return Err(self.reject_stale_token(ActivityAction::Ack, message));
            }
            FencedRow::Missing => {
                drop(tx);
                return Err(RelayError::NotFound(message_id.to_string()));
            }
        };

        let query = format!(
            "UPDATE {table} SET status = 'acknowledged', acknowledged_at = now(), \
             lock_token = NULL, locked_until = NULL \
             WHERE id = $1 RETURNING {MESSAGE_COLS}"
        );
        let row = sqlx::query(&query)
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(relay_store::classify)?;
        let acked = message_from_row(&row)?;

        let processing_ms = match (acked.dequeued_at, acked.acknowledged_at) {
            (Some(dequeued), Some(acknowledged)) => {
                Some((acknowledged - dequeued).num_milliseconds())
            }
            _ => None,
        };

        let mut ctx = DetectionContext::new(ActivityAction::Ack, Some(&acked));
        ctx.consumer_id = acked.consumer_id.as_deref();
        ctx.extra.processing_ms = processing_ms;
        let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);
        self.bump_consumer_anomalies(&mut tx, acked.consumer_id.as_deref(), &anomalies)
            .await?;

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Ack,
                message_id: Some(&acked.id),
                queue_name: &acked.queue_name,
                consumer_id: acked.consumer_id.as_deref(),
                message_type: Some(&acked.message_type),
                context: json!({
                    "attempt_count": acked.attempt_count,
                    "processing_ms": processing_ms,
                }),
                anomalies: &anomalies,
            },
        )
        .await
        .map_err(relay_store::classify)?;

        tx.commit().await.map_err(relay_store::classify)?;

        self.emitter().emit(QueueEvent::new(
            EventType::Ack,
            &acked.queue_name,
            json!({ "id": acked.id, "type": acked.message_type, "count": 1 }),
        ));
        broker_metrics::record_acked(&acked.queue_name);

        debug!(message_id = %acked.id, "Message acknowledged");
        Ok(acked)
    }

    /// Reject a message. Retries while attempts remain, dead-letters after.
    pub async fn nack(
        &self,
        message_id: &str,
        lock_token: &str,
        error_reason: Option<&str>,
    ) -> Result<Message> {
        relay_store::with_tx_retry("nack", || self.nack_once(message_id, lock_token, error_reason))
            .await
    }

    async fn nack_once(
        &self,
        message_id: &str,
        lock_token: &str,
        error_reason: Option<&str>,
    ) -> Result<Message> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let (table, message) = match self.fence(&mut tx, message_id, lock_token).await? {
            FencedRow::Held { table, message } => (table, message),
            FencedRow::Mismatch { message } => {
                drop(tx);
                return Err(self.reject_stale_token(ActivityAction::Nack, message));
            }
            FencedRow::Missing => {
                drop(tx);
                return Err(RelayError::NotFound(message_id.to_string()));
            }
        };

        let queue = self.get_queue(&message.queue_name).await?;
        let max_attempts = message.effective_max_attempts(queue.max_attempts);
        let exhausted = message.attempt_count >= max_attempts;

        let query = if exhausted {
            format!(
                "UPDATE {table} SET status = 'dead', lock_token = NULL, locked_until = NULL, \
                 last_error = $2 WHERE id = $1 RETURNING {MESSAGE_COLS}"
            )
        } else {
            format!(
                "UPDATE {table} SET status = 'queued', lock_token = NULL, locked_until = NULL, \
                 dequeued_at = NULL, consumer_id = NULL, last_error = $2 \
                 WHERE id = $1 RETURNING {MESSAGE_COLS}"
            )
        };

        let row = sqlx::query(&query)
            .bind(message_id)
            .bind(error_reason.unwrap_or("nack"))
            .fetch_one(&mut *tx)
            .await
            .map_err(relay_store::classify)?;
        let nacked = message_from_row(&row)?;

        let mut ctx = DetectionContext::new(ActivityAction::Nack, Some(&nacked));
        ctx.consumer_id = message.consumer_id.as_deref();
        ctx.error_reason = error_reason;
        ctx.extra.to_dead = exhausted;
        ctx.extra.requeued = !exhausted;
        ctx.extra.attempts_remaining = Some((max_attempts - nacked.attempt_count).max(0));
        let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);
        self.bump_consumer_anomalies(&mut tx, message.consumer_id.as_deref(), &anomalies)
            .await?;

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Nack,
                message_id: Some(&nacked.id),
                queue_name: &nacked.queue_name,
                consumer_id: message.consumer_id.as_deref(),
                message_type: Some(&nacked.message_type),
                context: json!({
                    "attempt_count": nacked.attempt_count,
                    "max_attempts": max_attempts,
                    "error": error_reason,
                    "dead": exhausted,
                }),
                anomalies: &anomalies,
            },
        )
        .await
        .map_err(relay_store::classify)?;

        if !exhausted {
            // The row is claimable again; wake blocked dequeuers on commit.
            relay_store::Store::notify(
                &mut *tx,
                &self.config().events.events_channel,
                &nacked.queue_name,
            )
            .await?;
        }

        tx.commit().await.map_err(relay_store::classify)?;

        if !exhausted {
            self.hub().publish_local(&nacked.queue_name);
        }
        self.emitter().emit(QueueEvent::new(
            EventType::Nack,
            &nacked.queue_name,
            json!({ "id": nacked.id, "dead": exhausted, "count": 1 }),
        ));
        broker_metrics::record_nacked(&nacked.queue_name, exhausted);

        if exhausted {
            warn!(message_id = %nacked.id, attempts = nacked.attempt_count, "Message dead-lettered");
        } else {
            debug!(message_id = %nacked.id, "Message returned to queue");
        }
        Ok(nacked)
    }

    /// Extend the lock deadline without rotating the token. Returns the
    /// updated row carrying the new `locked_until`.
    pub async fn touch(
        &self,
        message_id: &str,
        lock_token: &str,
        extend_seconds: Option<i64>,
    ) -> Result<Message> {
        if let Some(extend) = extend_seconds {
            if extend <= 0 {
                return Err(RelayError::invalid("extend_seconds must be positive"));
            }
        }

        relay_store::with_tx_retry("touch", || {
            self.touch_once(message_id, lock_token, extend_seconds)
        })
        .await
    }

    async fn touch_once(
        &self,
        message_id: &str,
        lock_token: &str,
        extend_seconds: Option<i64>,
    ) -> Result<Message> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let (table, message) = match self.fence(&mut tx, message_id, lock_token).await? {
            FencedRow::Held { table, message } => (table, message),
            FencedRow::Mismatch { message } => {
                drop(tx);
                return Err(self.reject_stale_token(ActivityAction::Touch, message));
            }
            FencedRow::Missing => {
                drop(tx);
                return Err(RelayError::NotFound(message_id.to_string()));
            }
        };

        let queue = self.get_queue(&message.queue_name).await?;
        let extend = extend_seconds.unwrap_or_else(|| {
            message.effective_ack_timeout(queue.ack_timeout_seconds)
        });

        let query = format!(
            "UPDATE {table} SET locked_until = now() + make_interval(secs => $2::bigint) \
             WHERE id = $1 RETURNING {MESSAGE_COLS}"
        );
        let row = sqlx::query(&query)
            .bind(message_id)
            .bind(extend)
            .fetch_one(&mut *tx)
            .await
            .map_err(relay_store::classify)?;
        let touched = message_from_row(&row)?;

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Touch,
                message_id: Some(&touched.id),
                queue_name: &touched.queue_name,
                consumer_id: touched.consumer_id.as_deref(),
                message_type: Some(&touched.message_type),
                context: json!({
                    "extend_seconds": extend,
                    "locked_until": touched.locked_until.map(|t| t.timestamp()),
                }),
                anomalies: &[],
            },
        )
        .await
        .map_err(relay_store::classify)?;

        tx.commit().await.map_err(relay_store::classify)?;

        debug!(message_id = %touched.id, extend_seconds = extend, "Lock extended");
        Ok(touched)
    }

    /// Locate the row and validate the caller's token. The returned
    /// `Held` row is locked by this transaction.
    async fn fence(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        message_id: &str,
        lock_token: &str,
    ) -> Result<FencedRow> {
        let Some((table, message)) = find_for_update(tx, message_id).await? else {
            return Ok(FencedRow::Missing);
        };

        let held = message.status == MessageStatus::Processing
            && message.lock_token.as_deref() == Some(lock_token);
        if held {
            Ok(FencedRow::Held { table, message })
        } else {
            Ok(FencedRow::Mismatch { message })
        }
    }

    /// Record the critical `lock_stolen` anomaly (out of band; the failed
    /// call is not a state transition) and produce the caller's error.
    fn reject_stale_token(&self, action: ActivityAction, message: Message) -> RelayError {
        warn!(
            message_id = %message.id,
            action = action.as_str(),
            "Completion rejected: stale lock token"
        );

        let mut ctx = DetectionContext::new(action, Some(&message));
        ctx.extra.lock_mismatch = true;
        ctx.consumer_id = message.consumer_id.as_deref();
        for anomaly in self.detectors.detect_all(&ctx, &self.config().activity) {
            self.record_detached_anomaly(
                anomaly,
                Some(message.id.clone()),
                Some(message.queue_name.clone()),
                message.consumer_id.clone(),
            );
        }
        broker_metrics::record_lock_lost(&message.queue_name);

        RelayError::LockLost(message.id)
    }

    async fn bump_consumer_anomalies(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        consumer_id: Option<&str>,
        anomalies: &[Anomaly],
    ) -> Result<()> {
        if let Some(consumer_id) = consumer_id {
            for anomaly in anomalies {
                stats::record_anomaly(tx, consumer_id, &anomaly.anomaly_type)
                    .await
                    .map_err(relay_store::classify)?;
            }
        }
        Ok(())
    }
}

/// Find a message row in any of the message tables and lock it.
pub(crate) async fn find_for_update(
    tx: &mut Transaction<'static, Postgres>,
    message_id: &str,
) -> Result<Option<(&'static str, Message)>> {
    for table in relay_store::schema::MESSAGE_TABLES {
        let query = format!("SELECT {MESSAGE_COLS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(message_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(relay_store::classify)?;
        if let Some(row) = row {
            return Ok(Some((table, message_from_row(&row)?)));
        }
    }
    Ok(None)
}
