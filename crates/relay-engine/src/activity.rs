//! Activity log and anomaly pipeline.
//!
//! Every observable state transition writes exactly one activity row inside
//! the same transaction as the state change, with any detector anomalies
//! attached. Failed completion calls (lock mismatches) are not transitions:
//! they produce an anomaly row with no activity row, written outside the
//! transaction and retried asynchronously on store failure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relay_common::{
    ActivityAction, ActivityLogEntry, Anomaly, AnomalyRecord, AnomalySeverity, AnomalySummary,
    QueueType, Result, StoreError,
};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{message_table, Engine};

/// One transition's audit payload.
pub(crate) struct ActivityEntry<'a> {
    pub action: ActivityAction,
    pub message_id: Option<&'a str>,
    pub queue_name: &'a str,
    pub consumer_id: Option<&'a str>,
    pub message_type: Option<&'a str>,
    pub context: serde_json::Value,
    pub anomalies: &'a [Anomaly],
}

/// Insert the activity row and its anomalies inside the caller's
/// transaction. Returns the log id, or None when the log is disabled.
pub(crate) async fn record(
    tx: &mut Transaction<'_, Postgres>,
    enabled: bool,
    entry: ActivityEntry<'_>,
) -> std::result::Result<Option<i64>, sqlx::Error> {
    if !enabled {
        return Ok(None);
    }

    let row = sqlx::query(
        r#"
        INSERT INTO activity_logs (action, message_id, queue_name, consumer_id, message_type, context)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING log_id
        "#,
    )
    .bind(entry.action.as_str())
    .bind(entry.message_id)
    .bind(entry.queue_name)
    .bind(entry.consumer_id)
    .bind(entry.message_type)
    .bind(&entry.context)
    .fetch_one(&mut **tx)
    .await?;

    let log_id: i64 = row.get("log_id");

    for anomaly in entry.anomalies {
        sqlx::query(
            r#"
            INSERT INTO anomalies
                (log_id, anomaly_type, severity, message_id, queue_name, consumer_id, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log_id)
        .bind(&anomaly.anomaly_type)
        .bind(anomaly.severity.as_str())
        .bind(entry.message_id)
        .bind(entry.queue_name)
        .bind(entry.consumer_id)
        .bind(&anomaly.details)
        .execute(&mut **tx)
        .await?;
    }

    Ok(Some(log_id))
}

impl Engine {
    /// Persist an anomaly that has no matching transition (e.g. a rejected
    /// completion call). Fire-and-forget with internal retry; a store
    /// failure here never affects the caller.
    pub(crate) fn record_detached_anomaly(
        &self,
        anomaly: Anomaly,
        message_id: Option<String>,
        queue_name: Option<String>,
        consumer_id: Option<String>,
    ) {
        if !self.config().activity.activity_log_enabled {
            return;
        }

        let pool = self.store().pool().clone();
        tokio::spawn(async move {
            let result = relay_store::with_retry("record_detached_anomaly", || async {
                sqlx::query(
                    r#"
                    INSERT INTO anomalies
                        (anomaly_type, severity, message_id, queue_name, consumer_id, details)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&anomaly.anomaly_type)
                .bind(anomaly.severity.as_str())
                .bind(&message_id)
                .bind(&queue_name)
                .bind(&consumer_id)
                .bind(&anomaly.details)
                .execute(&pool)
                .await
            })
            .await;

            if let Err(err) = result {
                error!(
                    anomaly_type = %anomaly.anomaly_type,
                    error = %err,
                    "Dropped detached anomaly after retries"
                );
            }
        });
    }

    /// Paged activity feed, newest first.
    pub async fn get_activity_logs(
        &self,
        filter: ActivityFilter,
        page: u32,
        size: u32,
    ) -> Result<(Vec<ActivityLogEntry>, i64)> {
        let limit = size.clamp(1, 500) as i64;
        let offset = page as i64 * limit;

        let rows = relay_store::with_retry("get_activity_logs", || async {
            sqlx::query(
                r#"
                SELECT log_id, timestamp, action, message_id, queue_name, consumer_id,
                       message_type, context
                FROM activity_logs
                WHERE ($1::text IS NULL OR queue_name = $1)
                  AND ($2::text IS NULL OR action = $2)
                  AND ($3::text IS NULL OR consumer_id = $3)
                  AND ($4::text IS NULL OR message_type = $4)
                ORDER BY timestamp DESC, log_id DESC
                LIMIT $5 OFFSET $6
                "#,
            )
            .bind(&filter.queue_name)
            .bind(filter.action.map(|a| a.as_str()))
            .bind(&filter.consumer_id)
            .bind(&filter.message_type)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.store().pool())
            .await
        })
        .await?;

        let total_row = relay_store::with_retry("count_activity_logs", || async {
            sqlx::query(
                r#"
                SELECT count(*) AS total
                FROM activity_logs
                WHERE ($1::text IS NULL OR queue_name = $1)
                  AND ($2::text IS NULL OR action = $2)
                  AND ($3::text IS NULL OR consumer_id = $3)
                  AND ($4::text IS NULL OR message_type = $4)
                "#,
            )
            .bind(&filter.queue_name)
            .bind(filter.action.map(|a| a.as_str()))
            .bind(&filter.consumer_id)
            .bind(&filter.message_type)
            .fetch_one(self.store().pool())
            .await
        })
        .await?;
        let total: i64 = total_row
            .try_get("total")
            .map_err(|e| StoreError::Failure(e.to_string()))?;

        let entries = self.attach_anomalies(rows).await?;
        Ok((entries, total))
    }

    /// Full audit trail of one message, chronological ascending.
    pub async fn get_message_history(&self, message_id: &str) -> Result<Vec<ActivityLogEntry>> {
        let rows = relay_store::with_retry("get_message_history", || async {
            sqlx::query(
                r#"
                SELECT log_id, timestamp, action, message_id, queue_name, consumer_id,
                       message_type, context
                FROM activity_logs
                WHERE message_id = $1
                ORDER BY timestamp ASC, log_id ASC
                "#,
            )
            .bind(message_id)
            .fetch_all(self.store().pool())
            .await
        })
        .await?;

        self.attach_anomalies(rows).await
    }

    /// Anomaly listing plus a `{total, by_type, by_severity}` summary.
    pub async fn get_anomalies(
        &self,
        filter: AnomalyFilter,
        ascending: bool,
        page: u32,
        size: u32,
    ) -> Result<(Vec<AnomalyRecord>, AnomalySummary)> {
        let limit = size.clamp(1, 500) as i64;
        let offset = page as i64 * limit;
        let order = if ascending { "ASC" } else { "DESC" };

        let query = format!(
            r#"
            SELECT anomaly_id, log_id, timestamp, anomaly_type, severity,
                   message_id, queue_name, consumer_id, details
            FROM anomalies
            WHERE ($1::text IS NULL OR anomaly_type = $1)
              AND ($2::text IS NULL OR severity = $2)
              AND ($3::text IS NULL OR queue_name = $3)
              AND ($4::text IS NULL OR consumer_id = $4)
            ORDER BY timestamp {order}, anomaly_id {order}
            LIMIT $5 OFFSET $6
            "#
        );

        let rows = relay_store::with_retry("get_anomalies", || async {
            sqlx::query(&query)
                .bind(&filter.anomaly_type)
                .bind(filter.severity.map(|s| s.as_str()))
                .bind(&filter.queue_name)
                .bind(&filter.consumer_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.store().pool())
                .await
        })
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(anomaly_record_from_row(row)?);
        }

        let summary_rows = relay_store::with_retry("summarize_anomalies", || async {
            sqlx::query(
                r#"
                SELECT anomaly_type, severity, count(*) AS count
                FROM anomalies
                WHERE ($1::text IS NULL OR anomaly_type = $1)
                  AND ($2::text IS NULL OR severity = $2)
                  AND ($3::text IS NULL OR queue_name = $3)
                  AND ($4::text IS NULL OR consumer_id = $4)
                GROUP BY anomaly_type, severity
                "#,
            )
            .bind(&filter.anomaly_type)
            .bind(filter.severity.map(|s| s.as_str()))
            .bind(&filter.queue_name)
            .bind(&filter.consumer_id)
            .fetch_all(self.store().pool())
            .await
        })
        .await?;

        let mut summary = AnomalySummary::default();
        for row in &summary_rows {
            let anomaly_type: String = row
                .try_get("anomaly_type")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let severity: String = row
                .try_get("severity")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            summary.total += count;
            *summary.by_type.entry(anomaly_type).or_insert(0) += count;
            *summary.by_severity.entry(severity).or_insert(0) += count;
        }

        Ok((records, summary))
    }

    /// Merge anomaly rows onto their activity rows; the most severe anomaly
    /// is the one surfaced on the entry.
    async fn attach_anomalies(
        &self,
        rows: Vec<sqlx::postgres::PgRow>,
    ) -> Result<Vec<ActivityLogEntry>> {
        let mut entries = Vec::with_capacity(rows.len());
        let mut log_ids = Vec::with_capacity(rows.len());

        for row in &rows {
            let action_raw: String = row
                .try_get("action")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let action = ActivityAction::parse(&action_raw)
                .ok_or_else(|| StoreError::Failure(format!("unknown action: {action_raw}")))?;
            let log_id: i64 = row
                .try_get("log_id")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            log_ids.push(log_id);

            entries.push(ActivityLogEntry {
                log_id,
                timestamp: row
                    .try_get("timestamp")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                action,
                message_id: row
                    .try_get("message_id")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                queue_name: row
                    .try_get("queue_name")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                consumer_id: row
                    .try_get("consumer_id")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                message_type: row
                    .try_get("message_type")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                context: row
                    .try_get("context")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                anomaly: None,
            });
        }

        if log_ids.is_empty() {
            return Ok(entries);
        }

        let anomaly_rows = relay_store::with_retry("fetch_log_anomalies", || async {
            sqlx::query(
                r#"
                SELECT log_id, anomaly_type, severity, details
                FROM anomalies
                WHERE log_id = ANY($1)
                ORDER BY anomaly_id ASC
                "#,
            )
            .bind(&log_ids)
            .fetch_all(self.store().pool())
            .await
        })
        .await?;

        for row in &anomaly_rows {
            let log_id: i64 = row
                .try_get("log_id")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let severity_raw: String = row
                .try_get("severity")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let severity = AnomalySeverity::parse(&severity_raw)
                .ok_or_else(|| StoreError::Failure(format!("unknown severity: {severity_raw}")))?;
            let anomaly = Anomaly {
                anomaly_type: row
                    .try_get("anomaly_type")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                severity,
                details: row
                    .try_get("details")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
            };

            if let Some(entry) = entries.iter_mut().find(|e| e.log_id == log_id) {
                let replace = entry
                    .anomaly
                    .as_ref()
                    .map(|existing| anomaly.severity > existing.severity)
                    .unwrap_or(true);
                if replace {
                    entry.anomaly = Some(anomaly);
                }
            }
        }

        Ok(entries)
    }

    /// One pass of the retention sweep: expired audit rows, expired terminal
    /// messages, and upcoming partitions for partitioned queues.
    pub async fn run_retention_sweep(&self) -> Result<()> {
        let cutoff =
            Utc::now() - ChronoDuration::hours(self.config().activity.activity_log_retention_hours);

        let removed_anomalies = relay_store::with_retry("expire_anomalies", || async {
            sqlx::query("DELETE FROM anomalies WHERE timestamp < $1")
                .bind(cutoff)
                .execute(self.store().pool())
                .await
        })
        .await?
        .rows_affected();

        let removed_logs = relay_store::with_retry("expire_activity_logs", || async {
            sqlx::query("DELETE FROM activity_logs WHERE timestamp < $1")
                .bind(cutoff)
                .execute(self.store().pool())
                .await
        })
        .await?
        .rows_affected();

        if removed_logs > 0 || removed_anomalies > 0 {
            info!(
                removed_logs,
                removed_anomalies, "Expired activity rows past retention"
            );
        }

        self.expire_terminal_messages().await?;
        self.ensure_partitions().await?;

        Ok(())
    }

    async fn expire_terminal_messages(&self) -> Result<()> {
        let queues = self.list_queues().await?;
        for (queue, _counts) in queues {
            let Some(retention) = queue.retention_interval_seconds else {
                continue;
            };
            let table = message_table(queue.queue_type);
            let cutoff = Utc::now() - ChronoDuration::seconds(retention);
            let query = format!(
                "DELETE FROM {table} WHERE queue_name = $1 \
                 AND status IN ('acknowledged', 'dead', 'archived') AND created_at < $2"
            );

            let removed = relay_store::with_retry("expire_terminal_messages", || async {
                sqlx::query(&query)
                    .bind(&queue.name)
                    .bind(cutoff)
                    .execute(self.store().pool())
                    .await
            })
            .await?
            .rows_affected();

            if removed > 0 {
                debug!(queue = %queue.name, removed, "Expired terminal messages");
            }
        }
        Ok(())
    }

    /// Create the current and next time partition for partitioned queues.
    /// Creation races and overlaps with the default partition are logged and
    /// skipped; the default partition keeps accepting rows either way.
    async fn ensure_partitions(&self) -> Result<()> {
        let queues = self.list_queues().await?;
        let interval = queues
            .iter()
            .filter(|(q, _)| q.queue_type == QueueType::Partitioned)
            .filter_map(|(q, _)| q.partition_interval_seconds)
            .min();

        let Some(interval) = interval.filter(|i| *i > 0) else {
            return Ok(());
        };

        let now = Utc::now().timestamp();
        for window in 0..2 {
            let start = (now / interval + window) * interval;
            let end = start + interval;
            let table = relay_store::schema::TABLE_PARTITIONED;
            let name = format!("{table}_p{start}");
            let query = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF {table} \
                 FOR VALUES FROM (to_timestamp({start})) TO (to_timestamp({end}))"
            );

            if let Err(err) = sqlx::query(&query).execute(self.store().pool()).await {
                warn!(partition = %name, error = %err, "Partition creation skipped");
            }
        }
        Ok(())
    }

    /// Retention loop; runs until shutdown.
    pub async fn run_retention_loop(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let period = Duration::from_secs(
            self.config()
                .activity
                .retention_sweep_interval_seconds
                .max(1),
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(period_secs = period.as_secs(), "Retention sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_retention_sweep().await {
                        warn!(error = %err, "Retention sweep failed");
                    }
                }
            }
        }
    }
}

/// Filters for the activity feed.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub queue_name: Option<String>,
    pub action: Option<ActivityAction>,
    pub consumer_id: Option<String>,
    pub message_type: Option<String>,
}

/// Filters for the anomaly listing.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub anomaly_type: Option<String>,
    pub severity: Option<AnomalySeverity>,
    pub queue_name: Option<String>,
    pub consumer_id: Option<String>,
}

pub(crate) fn anomaly_record_from_row(
    row: &sqlx::postgres::PgRow,
) -> std::result::Result<AnomalyRecord, StoreError> {
    let severity_raw: String = row
        .try_get("severity")
        .map_err(|e| StoreError::Failure(e.to_string()))?;
    let severity = AnomalySeverity::parse(&severity_raw)
        .ok_or_else(|| StoreError::Failure(format!("unknown severity: {severity_raw}")))?;

    let get = |col: &str| -> std::result::Result<_, StoreError> {
        row.try_get::<Option<String>, _>(col)
            .map_err(|e| StoreError::Failure(e.to_string()))
    };

    Ok(AnomalyRecord {
        anomaly_id: row
            .try_get("anomaly_id")
            .map_err(|e| StoreError::Failure(e.to_string()))?,
        log_id: row
            .try_get("log_id")
            .map_err(|e| StoreError::Failure(e.to_string()))?,
        timestamp: row
            .try_get::<DateTime<Utc>, _>("timestamp")
            .map_err(|e| StoreError::Failure(e.to_string()))?,
        anomaly_type: row
            .try_get("anomaly_type")
            .map_err(|e| StoreError::Failure(e.to_string()))?,
        severity,
        message_id: get("message_id")?,
        queue_name: get("queue_name")?,
        consumer_id: get("consumer_id")?,
        details: row
            .try_get("details")
            .map_err(|e| StoreError::Failure(e.to_string()))?,
    })
}
