//! Relay HTTP surface.
//!
//! A thin axum adapter over the broker engine: route table, body/param
//! shapes, error-to-status mapping, and the SSE bridge. The engine is
//! borrowed behind an `Arc`; nothing here owns broker state.

use axum::{
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use relay_engine::Engine;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod activity_api;
pub mod admin_api;
pub mod error;
pub mod events_api;
pub mod messages;
pub mod model;
pub mod queues_api;

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Basic liveness/health answer.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "LIVE" }))
}

/// Readiness: the store must answer.
async fn readiness(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.broker_counters().await?;
    Ok(Json(serde_json::json!({ "status": "READY" })))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        messages::enqueue,
        messages::enqueue_batch,
        messages::dequeue,
        messages::ack,
        messages::nack,
        messages::touch,
        admin_api::metrics,
        admin_api::status,
        admin_api::list_messages,
        admin_api::move_messages,
        admin_api::delete_message,
        admin_api::clear_queue,
        admin_api::clear_all,
        queues_api::create_queue,
        queues_api::list_queues,
        queues_api::get_queue,
        queues_api::update_queue,
        queues_api::delete_queue,
        queues_api::purge_queue,
        activity_api::activity,
        activity_api::message_history,
        activity_api::anomalies,
        activity_api::consumers,
        events_api::events,
        health,
    ),
    tags(
        (name = "Messages", description = "Enqueue, dequeue and completion"),
        (name = "Queues", description = "Queue registry"),
        (name = "Admin", description = "Operational tooling"),
        (name = "Activity", description = "Audit trail and anomalies"),
        (name = "Events", description = "Real-time change events"),
        (name = "Health", description = "Probes"),
    )
)]
pub struct ApiDoc;

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/queue/message",
            post(messages::enqueue).get(messages::dequeue),
        )
        .route("/queue/batch", post(messages::enqueue_batch))
        .route("/queue/ack", post(messages::ack))
        .route("/queue/message/:id/nack", post(messages::nack))
        .route("/queue/message/:id/touch", put(messages::touch))
        .route("/queue/message/:id", delete(admin_api::delete_message))
        .route("/queue/metrics", get(admin_api::metrics))
        .route("/queue/status", get(admin_api::status))
        .route("/queue/move", post(admin_api::move_messages))
        .route("/queue/clear", delete(admin_api::clear_all))
        .route("/queue/events", get(events_api::events))
        .route("/queue/activity", get(activity_api::activity))
        .route(
            "/queue/activity/message/:id",
            get(activity_api::message_history),
        )
        .route("/queue/activity/anomalies", get(activity_api::anomalies))
        .route("/queue/activity/consumers", get(activity_api::consumers))
        .route("/queue/:queue_name/messages", get(admin_api::list_messages))
        .route("/queue/:queue_name/clear", delete(admin_api::clear_queue))
        .route(
            "/queues",
            post(queues_api::create_queue).get(queues_api::list_queues),
        )
        .route(
            "/queues/:name",
            get(queues_api::get_queue)
                .put(queues_api::update_queue)
                .delete(queues_api::delete_queue),
        )
        .route("/queues/:name/purge", post(queues_api::purge_queue))
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
