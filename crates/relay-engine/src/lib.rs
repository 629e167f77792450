//! Relay broker engine.
//!
//! A single [`Engine`] value owns the queue registry, the enqueue/dequeue/
//! completion paths, the overdue-requeue worker, the activity/anomaly
//! pipeline and the change-event emitter. It is constructed once at process
//! start from a validated config and a connected store; HTTP handlers borrow
//! it behind an `Arc`.

use relay_common::{QueueType, Result};
use relay_config::RelayConfig;
use relay_store::{NotificationHub, Store};
use std::sync::Arc;

pub mod activity;
pub mod admin;
pub mod broker_metrics;
pub mod completion;
pub mod dequeue;
pub mod detectors;
pub mod enqueue;
pub mod events;
pub mod registry;
pub mod requeue;
pub mod stats;

mod row;

pub use activity::{ActivityFilter, AnomalyFilter};
pub use admin::{
    BrokerCounters, MessageFilter, MessageSort, MoveRequest, QueueStatusEntry, QueueStatusReport,
};
pub use dequeue::DequeueRequest;
pub use detectors::{ContextExtra, DetectionContext, Detector, DetectorRegistry};
pub use events::{EventEmitter, EventSubscription};
pub use requeue::RequeueTickReport;

/// Backing table for a queue's storage class.
pub(crate) fn message_table(queue_type: QueueType) -> &'static str {
    match queue_type {
        QueueType::Standard => relay_store::schema::TABLE_STANDARD,
        QueueType::Unlogged => relay_store::schema::TABLE_UNLOGGED,
        QueueType::Partitioned => relay_store::schema::TABLE_PARTITIONED,
    }
}

/// Column list shared by every message query, in `row` mapping order.
pub(crate) const MESSAGE_COLS: &str = "id, queue_name, message_type, payload, priority, status, \
     attempt_count, max_attempts, ack_timeout_seconds, lock_token, locked_until, consumer_id, \
     created_at, dequeued_at, acknowledged_at, last_error, payload_size";

/// The broker engine. Owns every message lifecycle path; all collaborators
/// are injected at construction (no globals).
pub struct Engine {
    store: Store,
    config: RelayConfig,
    emitter: EventEmitter,
    hub: Arc<NotificationHub>,
    detectors: DetectorRegistry,
    burst: stats::BurstTracker,
}

impl Engine {
    pub fn new(config: RelayConfig, store: Store, hub: Arc<NotificationHub>) -> Self {
        let emitter = EventEmitter::new(config.events.buffer_size);
        let burst = stats::BurstTracker::new();
        Self {
            store,
            config,
            emitter,
            hub,
            detectors: DetectorRegistry::builtin(),
            burst,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Ensure the configured default queue exists so a bare deployment
    /// accepts work immediately.
    pub async fn ensure_default_queue(&self) -> Result<()> {
        use relay_common::NewQueue;

        let name = self.config.queue.queue_name.clone();
        match self.get_queue(&name).await {
            Ok(_) => Ok(()),
            Err(relay_common::RelayError::QueueNotFound(_)) => {
                self.create_queue(NewQueue {
                    name,
                    ..Default::default()
                })
                .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

