//! Row -> entity mapping.

use chrono::{DateTime, Utc};
use relay_common::{Message, MessageStatus, QueueInfo, QueueType, StoreError};
use sqlx::postgres::PgRow;
use sqlx::Row;

pub(crate) fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| StoreError::Failure(e.to_string()))?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Failure(format!("unknown message status: {status_raw}")))?;

    Ok(Message {
        id: get(row, "id")?,
        queue_name: get(row, "queue_name")?,
        message_type: get(row, "message_type")?,
        payload: get(row, "payload")?,
        priority: get(row, "priority")?,
        status,
        attempt_count: get(row, "attempt_count")?,
        max_attempts: get(row, "max_attempts")?,
        ack_timeout_seconds: get(row, "ack_timeout_seconds")?,
        lock_token: get(row, "lock_token")?,
        locked_until: get(row, "locked_until")?,
        consumer_id: get(row, "consumer_id")?,
        created_at: get(row, "created_at")?,
        dequeued_at: get(row, "dequeued_at")?,
        acknowledged_at: get(row, "acknowledged_at")?,
        last_error: get(row, "last_error")?,
        payload_size: get(row, "payload_size")?,
    })
}

pub(crate) fn queue_from_row(row: &PgRow) -> Result<QueueInfo, StoreError> {
    let type_raw: String = get(row, "queue_type")?;
    let queue_type = QueueType::parse(&type_raw)
        .ok_or_else(|| StoreError::Failure(format!("unknown queue type: {type_raw}")))?;

    Ok(QueueInfo {
        name: get(row, "name")?,
        queue_type,
        ack_timeout_seconds: get(row, "ack_timeout_seconds")?,
        max_attempts: get(row, "max_attempts")?,
        partition_interval_seconds: get(row, "partition_interval_seconds")?,
        retention_interval_seconds: get(row, "retention_interval_seconds")?,
        created_at: get::<DateTime<Utc>>(row, "created_at")?,
        updated_at: get::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Failure(format!("column {column}: {e}")))
}
