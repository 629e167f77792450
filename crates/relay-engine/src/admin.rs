//! Admin operations: move, delete, purge, status and metrics views.
//!
//! `move` may reparent any message across queues and statuses, including
//! out of terminal states; it is the only path that does. Every admin
//! mutation is stamped with the manual-operation actor label and logged.

use relay_common::{
    mint_lock_token, ActivityAction, EventType, Message, MessageStatus, QueueCounts, QueueEvent,
    QueueInfo, QueueType, RelayError, Result, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;
use tracing::{debug, info};

use crate::activity::{record, ActivityEntry};
use crate::completion::find_for_update;
use crate::detectors::DetectionContext;
use crate::row::message_from_row;
use crate::{broker_metrics, message_table, Engine, MESSAGE_COLS};

/// Selector plus destination for an admin move.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MoveRequest {
    /// Explicit message ids; combined with the filters below when both are
    /// present.
    pub message_ids: Option<Vec<String>>,
    pub source_queue: Option<String>,
    pub source_status: Option<MessageStatus>,
    pub dest_queue: Option<String>,
    pub dest_status: Option<MessageStatus>,
}

/// Per-queue status rollup.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusEntry {
    pub name: String,
    pub queue_type: QueueType,
    pub counts: QueueCounts,
}

/// Response of the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusReport {
    pub queues: Vec<QueueStatusEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

/// Store-derived counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerCounters {
    pub queues: i64,
    pub consumers: i64,
    pub anomalies: i64,
    pub messages: QueueCounts,
}

/// Filters for the per-queue message listing.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub message_type: Option<String>,
    pub consumer_id: Option<String>,
    pub sort: MessageSort,
}

/// Sort order for message listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageSort {
    /// Newest first.
    #[default]
    CreatedAt,
    /// Dequeue order: highest priority first, oldest first within.
    Priority,
}

impl Engine {
    /// Move matching messages to a new queue and/or status. Returns the
    /// number of messages moved.
    pub async fn move_messages(&self, request: MoveRequest) -> Result<u64> {
        let has_selector = request.message_ids.as_ref().map_or(false, |v| !v.is_empty())
            || request.source_queue.is_some()
            || request.source_status.is_some();
        if !has_selector {
            return Err(RelayError::invalid(
                "move requires message_ids or a source filter",
            ));
        }
        if request.dest_queue.is_none() && request.dest_status.is_none() {
            return Err(RelayError::invalid(
                "move requires dest_queue or dest_status",
            ));
        }

        let dest_queue_info = match &request.dest_queue {
            Some(name) => Some(self.get_queue(name).await?),
            None => None,
        };

        let (batch_size, requeued_queues, event_queues) =
            relay_store::with_tx_retry("move_messages", || {
                self.move_once(&request, dest_queue_info.as_ref())
            })
            .await?;

        for queue_name in &requeued_queues {
            self.hub().publish_local(queue_name);
        }
        for queue_name in &event_queues {
            self.emitter().emit(QueueEvent::new(
                EventType::Move,
                queue_name,
                json!({ "count": batch_size }),
            ));
            broker_metrics::record_moved(queue_name, batch_size as u64);
        }

        if batch_size > 0 {
            info!(moved = batch_size, "Messages moved");
        }
        Ok(batch_size as u64)
    }

    /// One transaction applying the whole move.
    async fn move_once(
        &self,
        request: &MoveRequest,
        dest_queue_info: Option<&QueueInfo>,
    ) -> Result<(usize, Vec<String>, Vec<String>)> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        // Collect matching rows from every message table under row locks.
        let mut matched: Vec<(&'static str, Message)> = Vec::new();
        for table in relay_store::schema::MESSAGE_TABLES {
            let query = format!(
                r#"
                SELECT {MESSAGE_COLS} FROM {table}
                WHERE ($1::text[] IS NULL OR id = ANY($1))
                  AND ($2::text IS NULL OR queue_name = $2)
                  AND ($3::text IS NULL OR status = $3)
                FOR UPDATE
                "#
            );
            let rows = sqlx::query(&query)
                .bind(&request.message_ids)
                .bind(&request.source_queue)
                .bind(request.source_status.map(|s| s.as_str()))
                .fetch_all(&mut *tx)
                .await
                .map_err(relay_store::classify)?;
            for row in &rows {
                matched.push((table, message_from_row(row)?));
            }
        }

        if matched.is_empty() {
            tx.rollback().await.map_err(relay_store::classify)?;
            return Ok((0, Vec::new(), Vec::new()));
        }

        let batch_size = matched.len();
        let mut requeued_queues: Vec<String> = Vec::new();
        let mut event_queues: Vec<String> = Vec::new();

        for (index, (source_table, message)) in matched.iter().enumerate() {
            let dest_status = request.dest_status.unwrap_or(message.status);
            let dest_queue_name = request
                .dest_queue
                .clone()
                .unwrap_or_else(|| message.queue_name.clone());
            let dest_table = match dest_queue_info {
                Some(info) => message_table(info.queue_type),
                None => *source_table,
            };

            // Lock fields follow the destination status: a move into
            // `processing` mints a fresh token, everything else releases it.
            let (lock_token, locked_until_secs) = if dest_status == MessageStatus::Processing {
                let ack_timeout = match dest_queue_info {
                    Some(info) => message.effective_ack_timeout(info.ack_timeout_seconds),
                    None => message
                        .effective_ack_timeout(self.config().queue.ack_timeout_seconds),
                };
                (Some(mint_lock_token()), Some(ack_timeout))
            } else {
                (None, None)
            };
            let clear_dequeue_marks = dest_status == MessageStatus::Queued;

            if dest_table == *source_table {
                let query = format!(
                    r#"
                    UPDATE {dest_table}
                    SET queue_name = $2,
                        status = $3,
                        lock_token = $4,
                        locked_until = CASE WHEN $5::bigint IS NULL THEN NULL
                                            ELSE now() + make_interval(secs => $5) END,
                        dequeued_at = CASE WHEN $6 THEN NULL ELSE dequeued_at END,
                        consumer_id = CASE WHEN $6 THEN NULL ELSE consumer_id END
                    WHERE id = $1
                    "#
                );
                sqlx::query(&query)
                    .bind(&message.id)
                    .bind(&dest_queue_name)
                    .bind(dest_status.as_str())
                    .bind(&lock_token)
                    .bind(locked_until_secs)
                    .bind(clear_dequeue_marks)
                    .execute(&mut *tx)
                    .await
                    .map_err(relay_store::classify)?;
            } else {
                // Storage class changes move the row across tables.
                let delete = format!("DELETE FROM {source_table} WHERE id = $1");
                sqlx::query(&delete)
                    .bind(&message.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(relay_store::classify)?;

                let insert = format!(
                    r#"
                    INSERT INTO {dest_table}
                        (id, queue_name, message_type, payload, priority, status,
                         attempt_count, max_attempts, ack_timeout_seconds, lock_token,
                         locked_until, consumer_id, created_at, dequeued_at,
                         acknowledged_at, last_error, payload_size)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                            CASE WHEN $11::bigint IS NULL THEN NULL
                                 ELSE now() + make_interval(secs => $11) END,
                            $12, $13, $14, $15, $16, $17)
                    "#
                );
                sqlx::query(&insert)
                    .bind(&message.id)
                    .bind(&dest_queue_name)
                    .bind(&message.message_type)
                    .bind(&message.payload)
                    .bind(message.priority)
                    .bind(dest_status.as_str())
                    .bind(message.attempt_count)
                    .bind(message.max_attempts)
                    .bind(message.ack_timeout_seconds)
                    .bind(&lock_token)
                    .bind(locked_until_secs)
                    .bind(if clear_dequeue_marks {
                        None
                    } else {
                        message.consumer_id.clone()
                    })
                    .bind(message.created_at)
                    .bind(if clear_dequeue_marks {
                        None
                    } else {
                        message.dequeued_at
                    })
                    .bind(message.acknowledged_at)
                    .bind(&message.last_error)
                    .bind(message.payload_size)
                    .execute(&mut *tx)
                    .await
                    .map_err(relay_store::classify)?;
            }

            let mut ctx = DetectionContext::new(ActivityAction::Move, Some(message));
            ctx.extra.to_dead =
                dest_status == MessageStatus::Dead && message.status != MessageStatus::Dead;
            if index == 0 {
                ctx.extra.batch_size = Some(batch_size);
            }
            let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);

            record(
                &mut tx,
                self.config().activity.activity_log_enabled,
                ActivityEntry {
                    action: ActivityAction::Move,
                    message_id: Some(&message.id),
                    queue_name: &dest_queue_name,
                    consumer_id: None,
                    message_type: Some(&message.message_type),
                    context: json!({
                        "from_queue": message.queue_name.clone(),
                        "to_queue": dest_queue_name.clone(),
                        "from_status": message.status,
                        "to_status": dest_status,
                        "actor": self.config().actors.manual_operation_actor,
                    }),
                    anomalies: &anomalies,
                },
            )
            .await
            .map_err(relay_store::classify)?;

            if dest_status == MessageStatus::Queued && !requeued_queues.contains(&dest_queue_name) {
                requeued_queues.push(dest_queue_name.clone());
            }
            if !event_queues.contains(&dest_queue_name) {
                event_queues.push(dest_queue_name);
            }
        }

        for queue_name in &requeued_queues {
            relay_store::Store::notify(&mut *tx, &self.config().events.events_channel, queue_name)
                .await?;
        }

        tx.commit().await.map_err(relay_store::classify)?;

        Ok((batch_size, requeued_queues, event_queues))
    }

    /// Delete one message. Logged with the manual-operation actor.
    pub async fn delete_message(&self, message_id: &str) -> Result<Message> {
        let message =
            relay_store::with_tx_retry("delete_message", || self.delete_message_once(message_id))
                .await?;

        self.emitter().emit(QueueEvent::new(
            EventType::Delete,
            &message.queue_name,
            json!({ "id": message.id, "count": 1 }),
        ));

        debug!(message_id = %message.id, "Message deleted");
        Ok(message)
    }

    async fn delete_message_once(&self, message_id: &str) -> Result<Message> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let Some((table, message)) = find_for_update(&mut tx, message_id).await? else {
            drop(tx);
            return Err(RelayError::NotFound(message_id.to_string()));
        };

        let query = format!("DELETE FROM {table} WHERE id = $1");
        sqlx::query(&query)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(relay_store::classify)?;

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Delete,
                message_id: Some(&message.id),
                queue_name: &message.queue_name,
                consumer_id: None,
                message_type: Some(&message.message_type),
                context: json!({
                    "status": message.status,
                    "actor": self.config().actors.manual_operation_actor,
                }),
                anomalies: &[],
            },
        )
        .await
        .map_err(relay_store::classify)?;

        tx.commit().await.map_err(relay_store::classify)?;

        Ok(message)
    }

    /// Remove messages from one queue (or all queues) filtered by status.
    /// Returns the number of rows removed.
    pub async fn purge(
        &self,
        queue: Option<&str>,
        status: Option<MessageStatus>,
    ) -> Result<u64> {
        let scoped_queue: Option<QueueInfo> = match queue {
            Some(name) => Some(self.get_queue(name).await?),
            None => None,
        };

        let tables: Vec<&'static str> = match &scoped_queue {
            Some(info) => vec![message_table(info.queue_type)],
            None => relay_store::schema::MESSAGE_TABLES.to_vec(),
        };
        let queue_label = queue.unwrap_or("*");

        let removed = relay_store::with_tx_retry("purge", || {
            self.purge_once(queue, status, &tables, queue_label)
        })
        .await?;

        self.emitter().emit(QueueEvent::new(
            EventType::Clear,
            queue_label,
            json!({ "count": removed }),
        ));
        broker_metrics::record_purged(queue_label, removed);

        info!(queue = queue_label, removed, "Messages purged");
        Ok(removed)
    }

    async fn purge_once(
        &self,
        queue: Option<&str>,
        status: Option<MessageStatus>,
        tables: &[&'static str],
        queue_label: &str,
    ) -> Result<u64> {
        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let mut removed: u64 = 0;
        for table in tables {
            let query = format!(
                "DELETE FROM {table} \
                 WHERE ($1::text IS NULL OR queue_name = $1) \
                   AND ($2::text IS NULL OR status = $2)"
            );
            removed += sqlx::query(&query)
                .bind(queue)
                .bind(status.map(|s| s.as_str()))
                .execute(&mut *tx)
                .await
                .map_err(relay_store::classify)?
                .rows_affected();
        }

        let mut ctx = DetectionContext::new(ActivityAction::Clear, None);
        ctx.extra.batch_size = Some(removed as usize);
        let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);

        record(
            &mut tx,
            self.config().activity.activity_log_enabled,
            ActivityEntry {
                action: ActivityAction::Clear,
                message_id: None,
                queue_name: queue_label,
                consumer_id: None,
                message_type: None,
                context: json!({
                    "count": removed,
                    "status": status,
                    "actor": self.config().actors.manual_operation_actor,
                }),
                anomalies: &anomalies,
            },
        )
        .await
        .map_err(relay_store::classify)?;

        tx.commit().await.map_err(relay_store::classify)?;

        Ok(removed)
    }

    /// Status rollup, optionally with the queued/processing rows attached.
    pub async fn queue_status(
        &self,
        queue: Option<&str>,
        include_messages: bool,
    ) -> Result<QueueStatusReport> {
        let all = self.list_queues().await?;
        let queues: Vec<QueueStatusEntry> = all
            .into_iter()
            .filter(|(info, _)| queue.map_or(true, |name| info.name == name))
            .map(|(info, counts)| QueueStatusEntry {
                name: info.name,
                queue_type: info.queue_type,
                counts,
            })
            .collect();

        if let Some(name) = queue {
            if queues.is_empty() {
                return Err(RelayError::QueueNotFound(name.to_string()));
            }
        }

        let messages = if include_messages {
            let mut collected = Vec::new();
            for entry in &queues {
                let info = self.get_queue(&entry.name).await?;
                let (mut rows, _) = self
                    .list_messages(&info, MessageFilter::default(), 0, 100)
                    .await?;
                collected.append(&mut rows);
            }
            Some(collected)
        } else {
            None
        };

        Ok(QueueStatusReport { queues, messages })
    }

    /// Store-derived counters.
    pub async fn broker_counters(&self) -> Result<BrokerCounters> {
        let mut messages = QueueCounts::default();
        for table in relay_store::schema::MESSAGE_TABLES {
            let query = format!("SELECT status, count(*) AS count FROM {table} GROUP BY status");
            let rows = relay_store::with_retry("count_messages", || async {
                sqlx::query(&query).fetch_all(self.store().pool()).await
            })
            .await?;
            for row in &rows {
                let status_raw: String = row
                    .try_get("status")
                    .map_err(|e| StoreError::Failure(e.to_string()))?;
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| StoreError::Failure(e.to_string()))?;
                if let Some(status) = MessageStatus::parse(&status_raw) {
                    let current = match status {
                        MessageStatus::Queued => &mut messages.queued,
                        MessageStatus::Processing => &mut messages.processing,
                        MessageStatus::Acknowledged => &mut messages.acknowledged,
                        MessageStatus::Dead => &mut messages.dead,
                        MessageStatus::Archived => &mut messages.archived,
                    };
                    *current += count;
                }
            }
        }

        let row = relay_store::with_retry("count_registry", || async {
            sqlx::query(
                "SELECT (SELECT count(*) FROM queues) AS queues, \
                        (SELECT count(*) FROM consumer_stats) AS consumers, \
                        (SELECT count(*) FROM anomalies) AS anomalies",
            )
            .fetch_one(self.store().pool())
            .await
        })
        .await?;

        Ok(BrokerCounters {
            queues: row
                .try_get("queues")
                .map_err(|e| StoreError::Failure(e.to_string()))?,
            consumers: row
                .try_get("consumers")
                .map_err(|e| StoreError::Failure(e.to_string()))?,
            anomalies: row
                .try_get("anomalies")
                .map_err(|e| StoreError::Failure(e.to_string()))?,
            messages,
        })
    }

    /// Page through one queue's messages, newest first.
    pub async fn list_messages(
        &self,
        queue: &QueueInfo,
        filter: MessageFilter,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Message>, i64)> {
        let table = message_table(queue.queue_type);
        let limit = size.clamp(1, 500) as i64;
        let offset = page as i64 * limit;
        let order = match filter.sort {
            MessageSort::CreatedAt => "created_at DESC, id DESC",
            MessageSort::Priority => "priority DESC, created_at ASC",
        };

        let query = format!(
            r#"
            SELECT {MESSAGE_COLS} FROM {table}
            WHERE queue_name = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR message_type = $3)
              AND ($4::text IS NULL OR consumer_id = $4)
            ORDER BY {order}
            LIMIT $5 OFFSET $6
            "#
        );
        let rows = relay_store::with_retry("list_messages", || async {
            sqlx::query(&query)
                .bind(&queue.name)
                .bind(filter.status.map(|s| s.as_str()))
                .bind(&filter.message_type)
                .bind(&filter.consumer_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.store().pool())
                .await
        })
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(message_from_row(row)?);
        }

        let count_query = format!(
            r#"
            SELECT count(*) AS total FROM {table}
            WHERE queue_name = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR message_type = $3)
              AND ($4::text IS NULL OR consumer_id = $4)
            "#
        );
        let total_row = relay_store::with_retry("count_list_messages", || async {
            sqlx::query(&count_query)
                .bind(&queue.name)
                .bind(filter.status.map(|s| s.as_str()))
                .bind(&filter.message_type)
                .bind(&filter.consumer_id)
                .fetch_one(self.store().pool())
                .await
        })
        .await?;
        let total: i64 = total_row
            .try_get("total")
            .map_err(|e| StoreError::Failure(e.to_string()))?;

        Ok((messages, total))
    }

    /// Fetch one message by id, searching every message table.
    pub async fn get_message(&self, message_id: &str) -> Result<Message> {
        for table in relay_store::schema::MESSAGE_TABLES {
            let query = format!("SELECT {MESSAGE_COLS} FROM {table} WHERE id = $1");
            let row = relay_store::with_retry("get_message", || async {
                sqlx::query(&query)
                    .bind(message_id)
                    .fetch_optional(self.store().pool())
                    .await
            })
            .await?;
            if let Some(row) = row {
                return Ok(message_from_row(&row)?);
            }
        }
        Err(RelayError::NotFound(message_id.to_string()))
    }
}
