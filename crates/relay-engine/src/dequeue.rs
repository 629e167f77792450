//! Dequeue engine.
//!
//! Claims the single best runnable message atomically: a CTE selects the
//! candidate with `FOR UPDATE SKIP LOCKED` and the update flips it to
//! `processing` with a freshly minted lock token, so concurrent callers
//! never block on each other and never claim the same row. Callers may wait
//! for work: empty polls subscribe to the enqueue notification channel and
//! re-run the claim on every wakeup until the deadline.

use relay_common::{
    mint_lock_token, ActivityAction, EventType, Message, QueueEvent, QueueInfo, RelayError,
    Result,
};
use serde_json::json;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::activity::{record, ActivityEntry};
use crate::detectors::DetectionContext;
use crate::row::message_from_row;
use crate::{broker_metrics, message_table, stats, Engine, MESSAGE_COLS};

/// Fallback poll period while waiting: notifications can be lost across a
/// listener reconnect, so the wait never relies on them alone.
const WAIT_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Parameters of one dequeue call.
#[derive(Debug, Clone, Default)]
pub struct DequeueRequest {
    /// Target queue; the configured default applies when None.
    pub queue: Option<String>,
    /// How long to wait for a runnable message. Zero returns immediately.
    pub timeout_seconds: u64,
    /// Ack deadline for this claim, overriding message and queue settings.
    pub ack_timeout_seconds: Option<i64>,
    /// Only claim messages of this type.
    pub message_type: Option<String>,
    /// Label of the worker taking the lock.
    pub consumer_id: Option<String>,
}

impl Engine {
    /// Claim the best runnable message, waiting up to the request timeout.
    /// Returns None when nothing became runnable in time.
    pub async fn dequeue(&self, request: DequeueRequest) -> Result<Option<Message>> {
        self.dequeue_with_cancel(request, std::future::pending::<()>())
            .await
    }

    /// Like [`Engine::dequeue`], aborting with `Cancelled` when the given
    /// future resolves before a message is claimed.
    pub async fn dequeue_with_cancel(
        &self,
        request: DequeueRequest,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<Option<Message>> {
        let queue = self.resolve_queue(request.queue.as_deref()).await?;
        tokio::pin!(cancel);

        // Subscribe before the first claim so an enqueue landing between
        // claim and wait is not missed.
        let mut notifications = (request.timeout_seconds > 0).then(|| self.hub().subscribe());
        let deadline = Instant::now() + Duration::from_secs(request.timeout_seconds);

        loop {
            if let Some(message) = self.claim_one(&queue, &request).await? {
                return Ok(Some(message));
            }

            let Some(rx) = notifications.as_mut() else {
                return Ok(None);
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut cancel => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(remaining.min(WAIT_POLL_PERIOD)) => {}
                payload = rx.recv() => {
                    match payload {
                        // Only wake for this queue; anything else re-arms.
                        Ok(queue_name) if queue_name == queue.name => {}
                        Ok(_) => continue,
                        // Lagged or closed: fall back to deadline polling.
                        Err(_) => tokio::time::sleep(remaining.min(WAIT_POLL_PERIOD)).await,
                    }
                }
            }
        }
    }

    async fn claim_one(
        &self,
        queue: &QueueInfo,
        request: &DequeueRequest,
    ) -> Result<Option<Message>> {
        relay_store::with_tx_retry("dequeue_claim", || self.claim_once(queue, request)).await
    }

    async fn claim_once(
        &self,
        queue: &QueueInfo,
        request: &DequeueRequest,
    ) -> Result<Option<Message>> {
        let table = message_table(queue.queue_type);
        let lock_token = mint_lock_token();
        let returning = prefixed_cols("m");

        let query = format!(
            r#"
            WITH next_message AS (
                SELECT id FROM {table}
                WHERE queue_name = $1 AND status = 'queued'
                  AND ($2::text IS NULL OR message_type = $2)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} m
            SET status = 'processing',
                attempt_count = m.attempt_count + 1,
                lock_token = $3,
                locked_until = now() + make_interval(secs => COALESCE($4::bigint, m.ack_timeout_seconds, $5::bigint)),
                dequeued_at = now(),
                consumer_id = $6
            FROM next_message
            WHERE m.id = next_message.id
            RETURNING {returning}
            "#
        );

        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let row = sqlx::query(&query)
            .bind(&queue.name)
            .bind(&request.message_type)
            .bind(&lock_token)
            .bind(request.ack_timeout_seconds)
            .bind(queue.ack_timeout_seconds)
            .bind(&request.consumer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(relay_store::classify)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(relay_store::classify)?;
            return Ok(None);
        };
        let message = message_from_row(&row)?;

        let mut ctx = DetectionContext::new(ActivityAction::Dequeue, Some(&message));
        ctx.consumer_id = request.consumer_id.as_deref();
        if let Some(consumer_id) = &request.consumer_id {
            let window =
                Duration::from_secs(self.config().activity.burst_threshold_seconds.max(1) as u64);
            ctx.extra.burst_count = Some(self.burst.record(consumer_id, window));
            stats::record_dequeue(&mut tx, consumer_id)
                .await
                .map_err(relay_store::classify)?;
        }
        let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);

        if let Some(consumer_id) = &request.consumer_id {
            for anomaly in &anomalies {
                stats::record_anomaly(&mut tx, consumer_id, &anomaly.anomaly_type)
                    .await
                    .map_err(relay_store::classify)?;
            }
        }

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Dequeue,
                message_id: Some(&message.id),
                queue_name: &queue.name,
                consumer_id: request.consumer_id.as_deref(),
                message_type: Some(&message.message_type),
                context: json!({
                    "attempt_count": message.attempt_count,
                    "priority": message.priority,
                }),
                anomalies: &anomalies,
            },
        )
        .await
        .map_err(relay_store::classify)?;

        tx.commit().await.map_err(relay_store::classify)?;

        self.emitter().emit(QueueEvent::new(
            EventType::Dequeue,
            &queue.name,
            json!({
                "id": message.id,
                "type": message.message_type,
                "consumer_id": request.consumer_id,
                "count": 1,
            }),
        ));
        broker_metrics::record_dequeued(&queue.name);

        debug!(
            message_id = %message.id,
            queue = %queue.name,
            attempt = message.attempt_count,
            "Message claimed"
        );
        Ok(Some(message))
    }
}

/// `MESSAGE_COLS` qualified with a table alias, for queries where a join
/// makes bare column names ambiguous.
pub(crate) fn prefixed_cols(alias: &str) -> String {
    MESSAGE_COLS
        .split(", ")
        .map(|col| format!("{alias}.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}
