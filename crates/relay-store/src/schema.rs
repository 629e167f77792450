//! Idempotent schema bootstrap.
//!
//! Creates the queue registry, the three message tables (standard, unlogged,
//! partitioned parent with a default child), the activity log, anomalies and
//! consumer statistics, plus the indexes the dequeue scan and the history
//! queries depend on. Every statement is `IF NOT EXISTS`.

use relay_common::StoreError;
use sqlx::PgPool;
use tracing::info;

use crate::classify;

const MESSAGE_COLUMNS: &str = r#"
    id TEXT NOT NULL,
    queue_name TEXT NOT NULL REFERENCES queues(name) ON DELETE CASCADE,
    message_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'processing', 'acknowledged', 'dead', 'archived')),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER,
    ack_timeout_seconds BIGINT,
    lock_token TEXT,
    locked_until TIMESTAMPTZ,
    consumer_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    dequeued_at TIMESTAMPTZ,
    acknowledged_at TIMESTAMPTZ,
    last_error TEXT,
    payload_size BIGINT NOT NULL DEFAULT 0
"#;

/// Names of the message tables, one per queue storage class.
pub const TABLE_STANDARD: &str = "messages";
pub const TABLE_UNLOGGED: &str = "messages_unlogged";
pub const TABLE_PARTITIONED: &str = "messages_partitioned";

pub const MESSAGE_TABLES: [&str; 3] = [TABLE_STANDARD, TABLE_UNLOGGED, TABLE_PARTITIONED];

pub async fn bootstrap(pool: &PgPool) -> Result<(), StoreError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS queues (
            name TEXT PRIMARY KEY CHECK (name <> ''),
            queue_type TEXT NOT NULL DEFAULT 'standard'
                CHECK (queue_type IN ('standard', 'unlogged', 'partitioned')),
            ack_timeout_seconds BIGINT NOT NULL CHECK (ack_timeout_seconds > 0),
            max_attempts INTEGER NOT NULL CHECK (max_attempts > 0),
            partition_interval_seconds BIGINT,
            retention_interval_seconds BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_STANDARD} ({MESSAGE_COLUMNS}, PRIMARY KEY (id))"
        ),
        format!(
            "CREATE UNLOGGED TABLE IF NOT EXISTS {TABLE_UNLOGGED} ({MESSAGE_COLUMNS}, PRIMARY KEY (id))"
        ),
        // Partition key must be part of the primary key.
        format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_PARTITIONED} ({MESSAGE_COLUMNS}, \
             PRIMARY KEY (id, created_at)) PARTITION BY RANGE (created_at)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_PARTITIONED}_default \
             PARTITION OF {TABLE_PARTITIONED} DEFAULT"
        ),
        r#"
        CREATE TABLE IF NOT EXISTS activity_logs (
            log_id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            action TEXT NOT NULL,
            message_id TEXT,
            queue_name TEXT NOT NULL,
            consumer_id TEXT,
            message_type TEXT,
            context JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#
        .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS anomalies (
            anomaly_id BIGSERIAL PRIMARY KEY,
            log_id BIGINT REFERENCES activity_logs(log_id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            anomaly_type TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
            message_id TEXT,
            queue_name TEXT,
            consumer_id TEXT,
            details JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#
        .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS consumer_stats (
            consumer_id TEXT PRIMARY KEY,
            total_dequeued BIGINT NOT NULL DEFAULT 0,
            last_dequeue_at TIMESTAMPTZ,
            anomaly_counts JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#
        .to_string(),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await.map_err(classify)?;
    }

    // Dequeue scan index plus history/feed indexes.
    let mut indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_activity_logs_message \
         ON activity_logs (message_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_activity_logs_timestamp \
         ON activity_logs (timestamp DESC)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_anomalies_timestamp \
         ON anomalies (timestamp DESC)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_anomalies_type ON anomalies (anomaly_type)".to_string(),
    ];
    for table in MESSAGE_TABLES {
        indexes.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_dequeue \
             ON {table} (queue_name, status, priority DESC, created_at ASC)"
        ));
        indexes.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_overdue \
             ON {table} (locked_until) WHERE status = 'processing'"
        ));
    }

    for statement in &indexes {
        sqlx::query(statement).execute(pool).await.map_err(classify)?;
    }

    info!("Store schema bootstrapped");
    Ok(())
}
