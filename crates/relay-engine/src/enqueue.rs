//! Enqueue path.
//!
//! Single and batch insertion. Work is durable before the call returns; the
//! activity row lands in the same transaction as the insert, and the store
//! notification fires on commit so blocked dequeuers wake.

use relay_common::{
    tsid, ActivityAction, EventType, Message, NewMessage, QueueEvent, QueueInfo, RelayError,
    Result,
};
use serde_json::json;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use tracing::debug;

use crate::activity::{record, ActivityEntry};
use crate::detectors::DetectionContext;
use crate::row::message_from_row;
use crate::{broker_metrics, message_table, Engine, MESSAGE_COLS};

impl Engine {
    /// Enqueue one message. Returns the stored row.
    pub async fn enqueue(&self, new_message: NewMessage) -> Result<Message> {
        let queue = self.resolve_queue(new_message.queue.as_deref()).await?;
        self.validate_message(&new_message)?;

        let message =
            relay_store::with_tx_retry("enqueue", || self.enqueue_once(&queue, &new_message))
                .await?;

        self.hub().publish_local(&queue.name);
        self.emitter().emit(QueueEvent::new(
            EventType::Enqueue,
            &queue.name,
            json!({ "id": message.id, "type": message.message_type, "count": 1 }),
        ));
        broker_metrics::record_enqueued(&queue.name, 1);

        debug!(message_id = %message.id, queue = %queue.name, "Message enqueued");
        Ok(message)
    }

    /// One durable insert: row, activity, wakeup notification.
    async fn enqueue_once(&self, queue: &QueueInfo, new_message: &NewMessage) -> Result<Message> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;
        let message = self.insert_message(&mut tx, queue, new_message, None).await?;

        relay_store::Store::notify(&mut *tx, &self.config().events.events_channel, &queue.name)
            .await?;
        tx.commit().await.map_err(relay_store::classify)?;

        Ok(message)
    }

    /// Enqueue a batch in one transaction; partial failure is not allowed.
    /// Returns the assigned ids in input order.
    pub async fn enqueue_batch(&self, batch: Vec<NewMessage>) -> Result<Vec<String>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        // Resolve and validate everything up front so nothing is inserted on
        // a doomed batch.
        let mut queues: HashMap<String, QueueInfo> = HashMap::new();
        for new_message in &batch {
            self.validate_message(new_message)?;
            let name = new_message
                .queue
                .clone()
                .unwrap_or_else(|| self.config().queue.queue_name.clone());
            if !queues.contains_key(&name) {
                let queue = self.get_queue(&name).await?;
                queues.insert(name, queue);
            }
        }

        let batch_id = tsid::generate();
        let batch_size = batch.len();

        let (ids, touched_queues) =
            relay_store::with_tx_retry("enqueue_batch", || {
                self.enqueue_batch_once(&batch, &queues, &batch_id)
            })
            .await?;

        for queue_name in &touched_queues {
            self.hub().publish_local(queue_name);
            self.emitter().emit(QueueEvent::new(
                EventType::Enqueue,
                queue_name,
                json!({ "count": batch_size, "batch_id": batch_id }),
            ));
            broker_metrics::record_enqueued(queue_name, batch_size as u64);
        }

        debug!(batch_id = %batch_id, count = batch_size, "Batch enqueued");
        Ok(ids)
    }

    /// One all-or-nothing batch transaction. Returns the assigned ids and
    /// the distinct queues that received work.
    async fn enqueue_batch_once(
        &self,
        batch: &[NewMessage],
        queues: &HashMap<String, QueueInfo>,
        batch_id: &str,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let batch_size = batch.len();
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;
        let mut ids = Vec::with_capacity(batch_size);
        let mut touched_queues: Vec<String> = Vec::new();

        for (index, new_message) in batch.iter().enumerate() {
            let name = new_message
                .queue
                .as_deref()
                .unwrap_or(&self.config().queue.queue_name);
            let queue = &queues[name];

            let batch_meta = if index == 0 {
                Some((batch_id, batch_size))
            } else {
                Some((batch_id, 0))
            };
            let message = self
                .insert_message(&mut tx, queue, new_message, batch_meta)
                .await?;
            ids.push(message.id);

            if !touched_queues.contains(&queue.name) {
                touched_queues.push(queue.name.clone());
            }
        }

        for queue_name in &touched_queues {
            relay_store::Store::notify(&mut *tx, &self.config().events.events_channel, queue_name)
                .await?;
        }
        tx.commit().await.map_err(relay_store::classify)?;

        Ok((ids, touched_queues))
    }

    fn validate_message(&self, new_message: &NewMessage) -> Result<()> {
        let levels = self.config().queue.max_priority_levels;
        let priority = new_message.priority.unwrap_or(0);
        if priority < 0 || priority >= levels {
            return Err(RelayError::InvalidArgument(format!(
                "priority {priority} out of range [0, {levels})"
            )));
        }
        if new_message.message_type.trim().is_empty() {
            return Err(RelayError::invalid("message type must not be empty"));
        }
        if let Some(timeout) = new_message.ack_timeout_seconds {
            if timeout <= 0 {
                return Err(RelayError::invalid("ack_timeout_seconds must be positive"));
            }
        }
        if let Some(attempts) = new_message.max_attempts {
            if attempts <= 0 {
                return Err(RelayError::invalid("max_attempts must be positive"));
            }
        }
        Ok(())
    }

    /// Insert one message and its activity row. `batch_meta` carries
    /// `(batch_id, batch_size)`; the batch-level anomaly hooks fire on the
    /// row that reports a non-zero size.
    async fn insert_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        queue: &QueueInfo,
        new_message: &NewMessage,
        batch_meta: Option<(&str, usize)>,
    ) -> Result<Message> {
        let id = tsid::generate();
        let priority = new_message.priority.unwrap_or(0);
        let payload_size = serde_json::to_vec(&new_message.payload)
            .map(|bytes| bytes.len() as i64)
            .unwrap_or(0);

        let query = format!(
            "INSERT INTO {} (id, queue_name, message_type, payload, priority, status, \
             max_attempts, ack_timeout_seconds, payload_size) \
             VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $8) \
             RETURNING {MESSAGE_COLS}",
            message_table(queue.queue_type)
        );

        let row = sqlx::query(&query)
            .bind(&id)
            .bind(&queue.name)
            .bind(&new_message.message_type)
            .bind(&new_message.payload)
            .bind(priority)
            .bind(new_message.max_attempts)
            .bind(new_message.ack_timeout_seconds)
            .bind(payload_size)
            .fetch_one(&mut **tx)
            .await
            .map_err(relay_store::classify)?;
        let message = message_from_row(&row)?;

        let mut ctx = DetectionContext::new(ActivityAction::Enqueue, Some(&message));
        if let Some((_, size)) = batch_meta {
            if size > 0 {
                ctx.extra.batch_size = Some(size);
            }
        }
        let anomalies = self
            .detectors
            .detect_all(&ctx, &self.config().activity);

        let context = match batch_meta {
            Some((batch_id, _)) => json!({
                "priority": priority,
                "payload_size": payload_size,
                "batch_id": batch_id,
            }),
            None => json!({ "priority": priority, "payload_size": payload_size }),
        };

        record(
            tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Enqueue,
                message_id: Some(&message.id),
                queue_name: &queue.name,
                consumer_id: None,
                message_type: Some(&message.message_type),
                context,
                anomalies: &anomalies,
            },
        )
        .await
        .map_err(relay_store::classify)?;

        Ok(message)
    }
}
