//! Queue registry endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relay_common::{NewQueue, QueueUpdate};

use crate::error::{ApiResult, ErrorResponse};
use crate::model::{
    ClearParams, ClearResponse, CreateQueueRequest, DeleteQueueParams, QueueResponse,
    UpdateQueueRequest,
};
use crate::AppState;

/// Create a queue.
#[utoipa::path(
    post,
    path = "/queues",
    tag = "Queues",
    request_body = CreateQueueRequest,
    responses(
        (status = 201, description = "Queue created", body = QueueResponse),
        (status = 409, description = "Name already exists", body = ErrorResponse),
        (status = 400, description = "Invalid configuration", body = ErrorResponse)
    )
)]
pub async fn create_queue(
    State(state): State<AppState>,
    Json(request): Json<CreateQueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let queue = state
        .engine
        .create_queue(NewQueue {
            name: request.name,
            queue_type: request.queue_type.unwrap_or_default(),
            ack_timeout_seconds: request.ack_timeout_seconds,
            max_attempts: request.max_attempts,
            partition_interval_seconds: request.partition_interval_seconds,
            retention_interval_seconds: request.retention_interval_seconds,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(QueueResponse::from_info(queue, None)),
    ))
}

/// All queues with current row counts.
#[utoipa::path(
    get,
    path = "/queues",
    tag = "Queues",
    responses((status = 200, description = "Queues with counts", body = [QueueResponse]))
)]
pub async fn list_queues(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueResponse>>> {
    let queues = state.engine.list_queues().await?;
    Ok(Json(
        queues
            .into_iter()
            .map(|(info, counts)| QueueResponse::from_info(info, Some(counts)))
            .collect(),
    ))
}

/// One queue's configuration.
#[utoipa::path(
    get,
    path = "/queues/{name}",
    tag = "Queues",
    responses(
        (status = 200, description = "Queue configuration", body = QueueResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse)
    )
)]
pub async fn get_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<QueueResponse>> {
    let queue = state.engine.get_queue(&name).await?;
    Ok(Json(QueueResponse::from_info(queue, None)))
}

/// Update delivery policy. The storage class is immutable.
#[utoipa::path(
    put,
    path = "/queues/{name}",
    tag = "Queues",
    request_body = UpdateQueueRequest,
    responses(
        (status = 200, description = "Updated", body = QueueResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse)
    )
)]
pub async fn update_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UpdateQueueRequest>,
) -> ApiResult<Json<QueueResponse>> {
    let queue = state
        .engine
        .update_queue(
            &name,
            QueueUpdate {
                ack_timeout_seconds: request.ack_timeout_seconds,
                max_attempts: request.max_attempts,
                retention_interval_seconds: request.retention_interval_seconds,
            },
        )
        .await?;
    Ok(Json(QueueResponse::from_info(queue, None)))
}

/// Delete a queue; requires force=true when messages remain.
#[utoipa::path(
    delete,
    path = "/queues/{name}",
    tag = "Queues",
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Queue not found", body = ErrorResponse),
        (status = 409, description = "Queue not empty and force not set", body = ErrorResponse)
    )
)]
pub async fn delete_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<DeleteQueueParams>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .engine
        .delete_queue(&name, params.force.unwrap_or(false))
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true, "name": name })))
}

/// Purge a queue's messages by status.
#[utoipa::path(
    post,
    path = "/queues/{name}/purge",
    tag = "Queues",
    responses(
        (status = 200, description = "Rows removed", body = ClearResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse)
    )
)]
pub async fn purge_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ClearParams>,
) -> ApiResult<Json<ClearResponse>> {
    let cleared = state.engine.purge(Some(&name), params.status).await?;
    Ok(Json(ClearResponse { cleared }))
}
