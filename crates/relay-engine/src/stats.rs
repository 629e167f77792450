//! Consumer statistics.
//!
//! Durable counters live in `consumer_stats` and are updated inside the
//! dequeue transaction. The burst-detection sliding windows are process-local
//! and best-effort: they reset on restart and are never persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_common::{ConsumerStats, Result, StoreError};
use sqlx::{Postgres, Row, Transaction};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::Engine;

/// Per-consumer sliding dequeue windows.
pub(crate) struct BurstTracker {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl BurstTracker {
    pub(crate) fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Record one dequeue and return the number of dequeues by this consumer
    /// inside the window, including this one.
    pub(crate) fn record(&self, consumer_id: &str, window: Duration) -> usize {
        let now = Instant::now();
        let mut entry = self.windows.entry(consumer_id.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > window {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.push_back(now);
        entry.len()
    }
}

/// Bump the durable per-consumer dequeue counter. Runs inside the dequeue
/// transaction so the counter never drifts from the claim.
pub(crate) async fn record_dequeue(
    tx: &mut Transaction<'_, Postgres>,
    consumer_id: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO consumer_stats (consumer_id, total_dequeued, last_dequeue_at)
        VALUES ($1, 1, now())
        ON CONFLICT (consumer_id) DO UPDATE
        SET total_dequeued = consumer_stats.total_dequeued + 1,
            last_dequeue_at = now()
        "#,
    )
    .bind(consumer_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Bump a per-consumer anomaly counter.
pub(crate) async fn record_anomaly(
    tx: &mut Transaction<'_, Postgres>,
    consumer_id: &str,
    anomaly_type: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO consumer_stats (consumer_id, anomaly_counts)
        VALUES ($1, jsonb_build_object($2::text, 1))
        ON CONFLICT (consumer_id) DO UPDATE
        SET anomaly_counts = jsonb_set(
            consumer_stats.anomaly_counts,
            ARRAY[$2::text],
            to_jsonb(COALESCE((consumer_stats.anomaly_counts ->> $2)::bigint, 0) + 1)
        )
        "#,
    )
    .bind(consumer_id)
    .bind(anomaly_type)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Engine {
    /// Stats for one consumer, or all consumers ordered by recency.
    pub async fn get_consumer_stats(
        &self,
        consumer_id: Option<&str>,
    ) -> Result<Vec<ConsumerStats>> {
        let rows = relay_store::with_retry("get_consumer_stats", || async {
            let query = if consumer_id.is_some() {
                "SELECT consumer_id, total_dequeued, last_dequeue_at, anomaly_counts \
                 FROM consumer_stats WHERE consumer_id = $1"
            } else {
                "SELECT consumer_id, total_dequeued, last_dequeue_at, anomaly_counts \
                 FROM consumer_stats WHERE $1::text IS NULL \
                 ORDER BY last_dequeue_at DESC NULLS LAST"
            };
            sqlx::query(query)
                .bind(consumer_id)
                .fetch_all(self.store().pool())
                .await
        })
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            let counts: serde_json::Value = row
                .try_get("anomaly_counts")
                .map_err(|e| StoreError::Failure(e.to_string()))?;
            let anomaly_counts = counts
                .as_object()
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(0)))
                        .collect()
                })
                .unwrap_or_default();

            stats.push(ConsumerStats {
                consumer_id: row
                    .try_get("consumer_id")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                total_dequeued: row
                    .try_get("total_dequeued")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                last_dequeue_at: row
                    .try_get::<Option<DateTime<Utc>>, _>("last_dequeue_at")
                    .map_err(|e| StoreError::Failure(e.to_string()))?,
                anomaly_counts,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_window_counts_within_window() {
        let tracker = BurstTracker::new();
        let window = Duration::from_secs(10);
        assert_eq!(tracker.record("c1", window), 1);
        assert_eq!(tracker.record("c1", window), 2);
        assert_eq!(tracker.record("c1", window), 3);
    }

    #[test]
    fn test_burst_window_is_per_consumer() {
        let tracker = BurstTracker::new();
        let window = Duration::from_secs(10);
        assert_eq!(tracker.record("c1", window), 1);
        assert_eq!(tracker.record("c2", window), 1);
    }

    #[test]
    fn test_burst_window_expires_old_entries() {
        let tracker = BurstTracker::new();
        let window = Duration::from_millis(10);
        assert_eq!(tracker.record("c1", window), 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(tracker.record("c1", window), 1);
    }
}
