//! `LISTEN/NOTIFY` subscription.
//!
//! One dedicated connection per process listens on the configured events
//! channel; payloads (queue names) are fanned out in-process over a
//! broadcast channel so any number of blocked dequeuers can wait without
//! holding store connections.

use relay_common::StoreError;
use sqlx::postgres::{PgListener, PgPool};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::classify;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// In-process fan-out of store notifications.
pub struct NotificationHub {
    tx: broadcast::Sender<String>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Subscribe to raw notification payloads (queue names).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Inject a payload without a round-trip through the store. Used by the
    /// enqueue path so same-process dequeuers wake even before the
    /// notification arrives back over the wire.
    pub fn publish_local(&self, payload: &str) {
        let _ = self.tx.send(payload.to_string());
    }

    /// Run the listener loop until shutdown. Reconnects with a fixed delay
    /// when the dedicated connection drops.
    pub async fn run(
        &self,
        pool: PgPool,
        channel: String,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            match self.listen_once(&pool, &channel, &mut shutdown).await {
                Ok(()) => {
                    info!(channel = %channel, "Notification listener stopped");
                    return;
                }
                Err(err) => {
                    warn!(channel = %channel, error = %err, "Listener connection lost, reconnecting");
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn listen_once(
        &self,
        pool: &PgPool,
        channel: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(pool).await.map_err(classify)?;
        listener.listen(channel).await.map_err(classify)?;
        info!(channel = %channel, "Notification listener started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                notification = listener.recv() => {
                    let notification = notification.map_err(classify)?;
                    debug!(payload = %notification.payload(), "Store notification received");
                    // Send fails only when nobody is subscribed; that is fine.
                    let _ = self.tx.send(notification.payload().to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_publish_reaches_subscribers() {
        let hub = NotificationHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish_local("orders");
        assert_eq!(rx.recv().await.unwrap(), "orders");
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let hub = NotificationHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish_local("q1");
        assert_eq!(a.recv().await.unwrap(), "q1");
        assert_eq!(b.recv().await.unwrap(), "q1");
    }
}
