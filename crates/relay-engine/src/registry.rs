//! Queue registry.
//!
//! CRUD over named queues. `queue_type` is immutable after creation; only
//! the delivery policy (timeouts, attempts, retention) may change.

use relay_common::{
    MessageStatus, NewQueue, QueueCounts, QueueInfo, QueueType, QueueUpdate, RelayError, Result,
    StoreError,
};
use sqlx::Row;
use tracing::info;

use crate::row::queue_from_row;
use crate::{message_table, Engine};

impl Engine {
    pub async fn create_queue(&self, new_queue: NewQueue) -> Result<QueueInfo> {
        if new_queue.name.trim().is_empty() {
            return Err(RelayError::invalid("queue name must not be empty"));
        }
        if new_queue.queue_type == QueueType::Partitioned
            && new_queue
                .partition_interval_seconds
                .filter(|i| *i > 0)
                .is_none()
        {
            return Err(RelayError::invalid(
                "partitioned queues require a positive partition_interval",
            ));
        }

        let ack_timeout = new_queue
            .ack_timeout_seconds
            .unwrap_or(self.config().queue.ack_timeout_seconds);
        let max_attempts = new_queue
            .max_attempts
            .unwrap_or(self.config().queue.max_attempts);
        if ack_timeout <= 0 {
            return Err(RelayError::invalid("ack_timeout_seconds must be positive"));
        }
        if max_attempts <= 0 {
            return Err(RelayError::invalid("max_attempts must be positive"));
        }

        let row = relay_store::with_tx_retry("create_queue", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO queues
                    (name, queue_type, ack_timeout_seconds, max_attempts,
                     partition_interval_seconds, retention_interval_seconds)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING name, queue_type, ack_timeout_seconds, max_attempts,
                          partition_interval_seconds, retention_interval_seconds,
                          created_at, updated_at
                "#,
            )
            .bind(&new_queue.name)
            .bind(new_queue.queue_type.as_str())
            .bind(ack_timeout)
            .bind(max_attempts)
            .bind(new_queue.partition_interval_seconds)
            .bind(new_queue.retention_interval_seconds)
            .fetch_one(self.store().pool())
            .await;

            match result {
                Ok(row) => Ok(row),
                Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                    Err(RelayError::AlreadyExists(new_queue.name.clone()))
                }
                Err(err) => Err(relay_store::classify(err).into()),
            }
        })
        .await?;

        let queue = queue_from_row(&row)?;
        info!(queue = %queue.name, queue_type = %queue.queue_type, "Queue created");
        Ok(queue)
    }

    pub async fn get_queue(&self, name: &str) -> Result<QueueInfo> {
        let row = relay_store::with_retry("get_queue", || async {
            sqlx::query(
                r#"
                SELECT name, queue_type, ack_timeout_seconds, max_attempts,
                       partition_interval_seconds, retention_interval_seconds,
                       created_at, updated_at
                FROM queues WHERE name = $1
                "#,
            )
            .bind(name)
            .fetch_optional(self.store().pool())
            .await
        })
        .await?;

        match row {
            Some(row) => Ok(queue_from_row(&row)?),
            None => Err(RelayError::QueueNotFound(name.to_string())),
        }
    }

    /// Resolve the queue a request targets, falling back to the configured
    /// default when none was named.
    pub(crate) async fn resolve_queue(&self, name: Option<&str>) -> Result<QueueInfo> {
        let name = name.unwrap_or(&self.config().queue.queue_name);
        self.get_queue(name).await
    }

    /// All queues with their current row counts by status, computed from one
    /// aggregate per message table.
    pub async fn list_queues(&self) -> Result<Vec<(QueueInfo, QueueCounts)>> {
        let rows = relay_store::with_retry("list_queues", || async {
            sqlx::query(
                r#"
                SELECT name, queue_type, ack_timeout_seconds, max_attempts,
                       partition_interval_seconds, retention_interval_seconds,
                       created_at, updated_at
                FROM queues ORDER BY name ASC
                "#,
            )
            .fetch_all(self.store().pool())
            .await
        })
        .await?;

        let mut queues = Vec::with_capacity(rows.len());
        for row in &rows {
            queues.push((queue_from_row(row)?, QueueCounts::default()));
        }

        let count_query = format!(
            "SELECT queue_name, status, count(*) AS count FROM {} GROUP BY queue_name, status \
             UNION ALL \
             SELECT queue_name, status, count(*) AS count FROM {} GROUP BY queue_name, status \
             UNION ALL \
             SELECT queue_name, status, count(*) AS count FROM {} GROUP BY queue_name, status",
            relay_store::schema::TABLE_STANDARD,
            relay_store::schema::TABLE_UNLOGGED,
            relay_store::schema::TABLE_PARTITIONED,
        );

        let count_rows = relay_store::with_retry("count_queue_messages", || async {
            sqlx::query(&count_query).fetch_all(self.store().pool()).await
        })
        .await?;

        for row in &count_rows {
            let queue_name: String = row
                .try_get("queue_name")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let status_raw: String = row
                .try_get("status")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Failure(e.to_string()))?;

            if let (Some(status), Some(entry)) = (
                MessageStatus::parse(&status_raw),
                queues.iter_mut().find(|(q, _)| q.name == queue_name),
            ) {
                entry.1.set(status, count);
            }
        }

        Ok(queues)
    }

    /// Update the mutable policy of a queue. The storage class cannot change.
    pub async fn update_queue(&self, name: &str, update: QueueUpdate) -> Result<QueueInfo> {
        if let Some(timeout) = update.ack_timeout_seconds {
            if timeout <= 0 {
                return Err(RelayError::invalid("ack_timeout_seconds must be positive"));
            }
        }
        if let Some(attempts) = update.max_attempts {
            if attempts <= 0 {
                return Err(RelayError::invalid("max_attempts must be positive"));
            }
        }

        let row = relay_store::with_retry("update_queue", || async {
            sqlx::query(
                r#"
                UPDATE queues
                SET ack_timeout_seconds = COALESCE($2, ack_timeout_seconds),
                    max_attempts = COALESCE($3, max_attempts),
                    retention_interval_seconds = COALESCE($4, retention_interval_seconds),
                    updated_at = now()
                WHERE name = $1
                RETURNING name, queue_type, ack_timeout_seconds, max_attempts,
                          partition_interval_seconds, retention_interval_seconds,
                          created_at, updated_at
                "#,
            )
            .bind(name)
            .bind(update.ack_timeout_seconds)
            .bind(update.max_attempts)
            .bind(update.retention_interval_seconds)
            .fetch_optional(self.store().pool())
            .await
        })
        .await?;

        match row {
            Some(row) => Ok(queue_from_row(&row)?),
            None => Err(RelayError::QueueNotFound(name.to_string())),
        }
    }

    /// Delete a queue. Refuses when messages remain unless forced.
    pub async fn delete_queue(&self, name: &str, force: bool) -> Result<()> {
        let queue = self.get_queue(name).await?;

        if !force {
            let table = message_table(queue.queue_type);
            let query = format!("SELECT count(*) AS count FROM {table} WHERE queue_name = $1");
            let row = relay_store::with_retry("count_queue_rows", || async {
                sqlx::query(&query)
                    .bind(name)
                    .fetch_one(self.store().pool())
                    .await
            })
            .await?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            if count > 0 {
                return Err(RelayError::conflict(format!(
                    "queue {name} holds {count} messages; pass force=true to delete"
                )));
            }
        }

        relay_store::with_retry("delete_queue", || async {
            sqlx::query("DELETE FROM queues WHERE name = $1")
                .bind(name)
                .execute(self.store().pool())
                .await
        })
        .await?;

        info!(queue = %name, force, "Queue deleted");
        Ok(())
    }
}
