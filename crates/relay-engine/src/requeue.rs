//! Overdue-requeue worker.
//!
//! One task per process; at most one instance across the deployment does
//! work per tick, gated by a session advisory lock on a fixed key. Rows
//! whose lock deadline passed are returned to `queued` while attempts
//! remain, dead-lettered otherwise, in batched transactions.

use relay_common::{ActivityAction, EventType, Message, QueueEvent, Result};
use sqlx::Row;
use relay_store::advisory::{AdvisoryGuard, REQUEUE_WORKER_LOCK_KEY};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::activity::{record, ActivityEntry};
use crate::dequeue::prefixed_cols;
use crate::detectors::DetectionContext;
use crate::row::message_from_row;
use crate::{broker_metrics, stats, Engine};

/// What one tick did. `skipped` means another replica held the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueTickReport {
    pub skipped: bool,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl Engine {
    /// Worker loop; runs until shutdown.
    pub async fn run_requeue_worker(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_millis(self.config().requeue.overdue_check_interval_ms.max(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(period_ms = period.as_millis() as u64, "Overdue-requeue worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Overdue-requeue worker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.requeue_tick().await {
                        Ok(report) if report.requeued + report.dead_lettered > 0 => {
                            info!(
                                requeued = report.requeued,
                                dead_lettered = report.dead_lettered,
                                "Requeue tick reclaimed overdue locks"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "Requeue tick failed"),
                    }
                }
            }
        }
    }

    /// One tick: take the cluster-wide lock, sweep every message table, and
    /// release the lock on all exit paths.
    pub async fn requeue_tick(&self) -> Result<RequeueTickReport> {
        let guard =
            match AdvisoryGuard::try_acquire(self.store().pool(), REQUEUE_WORKER_LOCK_KEY).await? {
                Some(guard) => guard,
                None => {
                    debug!("Another replica holds the requeue lock, skipping tick");
                    return Ok(RequeueTickReport {
                        skipped: true,
                        ..Default::default()
                    });
                }
            };

        let outcome = self.sweep_overdue().await;

        if let Err(err) = guard.release().await {
            warn!(error = %err, "Failed to release requeue advisory lock cleanly");
        }

        outcome
    }

    async fn sweep_overdue(&self) -> Result<RequeueTickReport> {
        let mut report = RequeueTickReport::default();
        let batch_size = self.config().requeue.requeue_batch_size;

        for table in relay_store::schema::MESSAGE_TABLES {
            loop {
                let processed = self.reclaim_batch(table, batch_size).await?;
                report.requeued += processed.requeued;
                report.dead_lettered += processed.dead_lettered;
                if (processed.requeued + processed.dead_lettered) < batch_size as u64 {
                    break;
                }
            }
        }

        Ok(report)
    }

    /// One transaction reclaiming at most `batch_size` overdue rows from one
    /// table. The transaction is retried on transient store errors; events
    /// fire once, after it lands.
    async fn reclaim_batch(&self, table: &'static str, batch_size: i64) -> Result<RequeueTickReport> {
        let (report, emitted, requeued_queues) =
            relay_store::with_tx_retry("requeue_reclaim", || {
                self.reclaim_batch_once(table, batch_size)
            })
            .await?;

        for queue_name in &requeued_queues {
            self.hub().publish_local(queue_name);
        }
        for (message, exhausted) in emitted {
            let event_type = if exhausted {
                EventType::Timeout
            } else {
                EventType::Requeue
            };
            self.emitter().emit(QueueEvent::new(
                event_type,
                &message.queue_name,
                json!({ "id": message.id, "dead": exhausted, "count": 1 }),
            ));
            broker_metrics::record_timeout(&message.queue_name, exhausted);
        }

        Ok(report)
    }

    async fn reclaim_batch_once(
        &self,
        table: &'static str,
        batch_size: i64,
    ) -> Result<(RequeueTickReport, Vec<(Message, bool)>, Vec<String>)> {
        let returning = prefixed_cols("m");
        let select = format!(
            r#"
            SELECT {returning},
                   q.max_attempts AS queue_max_attempts,
                   q.ack_timeout_seconds AS queue_ack_timeout
            FROM {table} m
            JOIN queues q ON q.name = m.queue_name
            WHERE m.status = 'processing' AND m.locked_until < now()
            ORDER BY m.locked_until ASC
            LIMIT $1
            FOR UPDATE OF m SKIP LOCKED
            "#
        );

        let mut tx = self
            .store()
            .begin(relay_store::Isolation::ReadCommitted)
            .await?;

        let rows = sqlx::query(&select)
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .await
            .map_err(relay_store::classify)?;

        if rows.is_empty() {
            tx.rollback().await.map_err(relay_store::classify)?;
            return Ok((RequeueTickReport::default(), Vec::new(), Vec::new()));
        }

        let mut report = RequeueTickReport::default();
        let mut emitted: Vec<(Message, bool)> = Vec::with_capacity(rows.len());
        let mut requeued_queues: Vec<String> = Vec::new();

        for row in &rows {
            let message = message_from_row(row)?;
            let queue_max_attempts: i32 = row
                .try_get("queue_max_attempts")
                .map_err(|e| relay_common::StoreError::Failure(e.to_string()))?;
            let queue_ack_timeout: i64 = row
                .try_get("queue_ack_timeout")
                .map_err(|e| relay_common::StoreError::Failure(e.to_string()))?;

            let max_attempts = message.effective_max_attempts(queue_max_attempts);
            let exhausted = message.attempt_count >= max_attempts;

            let update = if exhausted {
                format!(
                    "UPDATE {table} SET status = 'dead', lock_token = NULL, locked_until = NULL, \
                     last_error = 'ack timeout exceeded' WHERE id = $1"
                )
            } else {
                format!(
                    "UPDATE {table} SET status = 'queued', lock_token = NULL, locked_until = NULL, \
                     dequeued_at = NULL, consumer_id = NULL, \
                     last_error = 'ack timeout exceeded' WHERE id = $1"
                )
            };
            sqlx::query(&update)
                .bind(&message.id)
                .execute(&mut *tx)
                .await
                .map_err(relay_store::classify)?;

            let mut ctx = DetectionContext::new(ActivityAction::Timeout, Some(&message));
            ctx.consumer_id = message.consumer_id.as_deref();
            ctx.error_reason = Some("ack timeout exceeded");
            ctx.extra.to_dead = exhausted;
            ctx.extra.requeued = !exhausted;
            ctx.extra.effective_ack_timeout =
                Some(message.effective_ack_timeout(queue_ack_timeout));
            let anomalies = self.detectors.detect_all(&ctx, &self.config().activity);

            if let Some(consumer_id) = message.consumer_id.as_deref() {
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
                    action: ActivityAction::Timeout,
                    message_id: Some(&message.id),
                    queue_name: &message.queue_name,
                    consumer_id: message.consumer_id.as_deref(),
                    message_type: Some(&message.message_type),
                    context: json!({
                        "attempt_count": message.attempt_count,
                        "max_attempts": max_attempts,
                        "dead": exhausted,
                        "actor": self.config().actors.relay_actor,
                    }),
                    anomalies: &anomalies,
                },
            )
            .await
            .map_err(relay_store::classify)?;

            if exhausted {
                report.dead_lettered += 1;
            } else {
                report.requeued += 1;
                if !requeued_queues.contains(&message.queue_name) {
                    requeued_queues.push(message.queue_name.clone());
                }
            }
            emitted.push((message, exhausted));
        }

        for queue_name in &requeued_queues {
            relay_store::Store::notify(&mut *tx, &self.config().events.events_channel, queue_name)
                .await?;
        }

        tx.commit().await.map_err(relay_store::classify)?;

        Ok((report, emitted, requeued_queues))
    }
}
