//! Server-sent change events.
//!
//! Frames are `event: queue-update` with a `{type, queue, timestamp,
//! payload}` JSON body; a `ping` event fires at the configured heartbeat
//! interval. Subscribers without an Authorization header receive the
//! payload-redacted variant (counts only).

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

use crate::AppState;

/// Subscribe to the broker's change events.
#[utoipa::path(
    get,
    path = "/queue/events",
    tag = "Events",
    responses((status = 200, description = "SSE stream of queue-update events",
               content_type = "text/event-stream"))
)]
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let authenticated = headers.contains_key(axum::http::header::AUTHORIZATION);
    let subscription = state.engine.emitter().subscribe();
    let ping_interval = Duration::from_secs(
        state
            .engine
            .config()
            .events
            .ping_interval_seconds
            .max(1),
    );
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(authenticated, "SSE subscriber attached");

    let stream = futures::stream::unfold(
        (subscription, ticker, authenticated),
        |(mut subscription, mut ticker, authenticated)| async move {
            loop {
                tokio::select! {
                    event = subscription.next() => {
                        let Some(event) = event else {
                            // Emitter gone: end the stream.
                            return None;
                        };
                        let visible = if authenticated { event } else { event.redacted() };
                        let data = match serde_json::to_string(&visible) {
                            Ok(data) => data,
                            Err(_) => continue,
                        };
                        let frame = Event::default().event("queue-update").data(data);
                        return Some((Ok(frame), (subscription, ticker, authenticated)));
                    }
                    _ = ticker.tick() => {
                        let frame = Event::default().event("ping").data("{}");
                        return Some((Ok(frame), (subscription, ticker, authenticated)));
                    }
                }
            }
        },
    );

    Sse::new(stream)
}
