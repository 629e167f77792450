//! Metrics instrumentation for the broker engine.
//!
//! Counters for the message lifecycle, exported by the server binary
//! through the Prometheus recorder.

use metrics::counter;

pub fn record_enqueued(queue: &str, count: u64) {
    counter!(
        "relay_messages_enqueued_total",
        "queue" => queue.to_string()
    )
    .increment(count);
}

pub fn record_dequeued(queue: &str) {
    counter!(
        "relay_messages_dequeued_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_acked(queue: &str) {
    counter!(
        "relay_messages_acked_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_nacked(queue: &str, dead: bool) {
    counter!(
        "relay_messages_nacked_total",
        "queue" => queue.to_string(),
        "dead" => dead.to_string()
    )
    .increment(1);
}

pub fn record_timeout(queue: &str, dead: bool) {
    counter!(
        "relay_messages_timed_out_total",
        "queue" => queue.to_string(),
        "dead" => dead.to_string()
    )
    .increment(1);
}

pub fn record_lock_lost(queue: &str) {
    counter!(
        "relay_lock_lost_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_moved(queue: &str, count: u64) {
    counter!(
        "relay_messages_moved_total",
        "queue" => queue.to_string()
    )
    .increment(count);
}

pub fn record_purged(queue: &str, count: u64) {
    counter!(
        "relay_messages_purged_total",
        "queue" => queue.to_string()
    )
    .increment(count);
}
