//! In-process change-event fan-out.
//!
//! Every state change publishes one coarse-grained [`QueueEvent`]. Delivery
//! is best-effort: each subscriber has a bounded buffer and a subscriber
//! that stops draining loses the oldest events, never slowing the
//! publishers. Per-subscriber order is FIFO; there is no cross-subscriber
//! ordering guarantee.

use relay_common::QueueEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub struct EventEmitter {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventEmitter {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(16));
        Self { tx }
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// not an error.
    pub fn emit(&self, event: QueueEvent) {
        trace!(event_type = event.event_type.as_str(), queue = %event.queue, "Emitting event");
        let _ = self.tx.send(event);
    }

    /// Subscribe; dropping the returned handle unsubscribes.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A single subscriber's view of the event stream.
pub struct EventSubscription {
    rx: broadcast::Receiver<QueueEvent>,
}

impl EventSubscription {
    /// Next event, skipping over anything dropped while this subscriber
    /// lagged. Returns None once the emitter is gone.
    pub async fn next(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::EventType;

    fn event(queue: &str, n: i32) -> QueueEvent {
        QueueEvent::new(EventType::Enqueue, queue, serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let emitter = EventEmitter::new(16);
        let mut sub = emitter.subscribe();

        emitter.emit(event("q", 1));
        emitter.emit(event("q", 2));

        assert_eq!(sub.next().await.unwrap().payload["n"], 1);
        assert_eq!(sub.next().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let emitter = EventEmitter::new(16);
        emitter.emit(event("q", 1));
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_but_recovers() {
        let emitter = EventEmitter::new(16);
        let mut sub = emitter.subscribe();

        for n in 0..100 {
            emitter.emit(event("q", n));
        }

        // Buffer is 16: the oldest events are gone but the stream resumes.
        let first = sub.next().await.unwrap();
        assert!(first.payload["n"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let emitter = EventEmitter::new(16);
        let sub = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);
        drop(sub);
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
