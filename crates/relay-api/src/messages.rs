//! Producer/consumer message endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relay_engine::DequeueRequest;
use tracing::debug;

use crate::error::{ApiResult, ErrorResponse};
use crate::model::{
    AckRequest, BatchEnqueueRequest, BatchEnqueueResponse, DequeueParams, EnqueueRequest,
    EnqueueResponse, MessageResponse, NackRequest, TouchRequest, TouchResponse,
};
use crate::AppState;

/// Enqueue a single message.
#[utoipa::path(
    post,
    path = "/queue/message",
    tag = "Messages",
    request_body = EnqueueRequest,
    responses(
        (status = 201, description = "Message stored durably", body = EnqueueResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse),
        (status = 400, description = "Invalid priority or payload", body = ErrorResponse)
    )
)]
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state.engine.enqueue(request.into()).await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            id: message.id,
            queue: message.queue_name,
        }),
    ))
}

/// Enqueue a batch atomically.
#[utoipa::path(
    post,
    path = "/queue/batch",
    tag = "Messages",
    request_body = BatchEnqueueRequest,
    responses(
        (status = 201, description = "All messages stored", body = BatchEnqueueResponse),
        (status = 400, description = "Batch rejected; nothing stored", body = ErrorResponse)
    )
)]
pub async fn enqueue_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchEnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let ids = state
        .engine
        .enqueue_batch(request.messages.into_iter().map(Into::into).collect())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(BatchEnqueueResponse {
            count: ids.len(),
            ids,
        }),
    ))
}

/// Claim the best runnable message, optionally waiting for one.
#[utoipa::path(
    get,
    path = "/queue/message",
    tag = "Messages",
    responses(
        (status = 200, description = "Message claimed", body = MessageResponse),
        (status = 404, description = "Nothing runnable before the timeout", body = ErrorResponse)
    )
)]
pub async fn dequeue(
    State(state): State<AppState>,
    Query(params): Query<DequeueParams>,
) -> ApiResult<axum::response::Response> {
    let claimed = state
        .engine
        .dequeue(DequeueRequest {
            queue: params.queue,
            timeout_seconds: params.timeout.unwrap_or(0),
            ack_timeout_seconds: params.ack_timeout,
            message_type: params.message_type,
            consumer_id: params.consumer_id,
        })
        .await?;

    match claimed {
        Some(message) => {
            debug!(message_id = %message.id, "Dequeue served");
            Ok(Json(MessageResponse::from(message)).into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "NO_MESSAGE".to_string(),
                message: "no runnable message available".to_string(),
            }),
        )
            .into_response()),
    }
}

/// Acknowledge a message; the lock token must still be the live one.
#[utoipa::path(
    post,
    path = "/queue/ack",
    tag = "Messages",
    request_body = AckRequest,
    responses(
        (status = 200, description = "Acknowledged", body = MessageResponse),
        (status = 404, description = "Unknown message", body = ErrorResponse),
        (status = 409, description = "LOCK_LOST: token no longer current", body = ErrorResponse)
    )
)]
pub async fn ack(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let message = state
        .engine
        .ack(&request.message_id, &request.lock_token)
        .await?;
    Ok(Json(message.into()))
}

/// Reject a message: retried while attempts remain, dead-lettered after.
#[utoipa::path(
    post,
    path = "/queue/message/{id}/nack",
    tag = "Messages",
    request_body = NackRequest,
    responses(
        (status = 200, description = "Requeued or dead-lettered", body = MessageResponse),
        (status = 404, description = "Unknown message", body = ErrorResponse),
        (status = 409, description = "LOCK_LOST: token no longer current", body = ErrorResponse)
    )
)]
pub async fn nack(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<NackRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let message = state
        .engine
        .nack(&id, &request.lock_token, request.error.as_deref())
        .await?;
    Ok(Json(message.into()))
}

/// Extend the lock deadline without rotating the token.
#[utoipa::path(
    put,
    path = "/queue/message/{id}/touch",
    tag = "Messages",
    request_body = TouchRequest,
    responses(
        (status = 200, description = "Deadline extended", body = TouchResponse),
        (status = 404, description = "Unknown message", body = ErrorResponse),
        (status = 409, description = "LOCK_LOST: token no longer current", body = ErrorResponse)
    )
)]
pub async fn touch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TouchRequest>,
) -> ApiResult<Json<TouchResponse>> {
    let message = state
        .engine
        .touch(&id, &request.lock_token, request.extend_seconds)
        .await?;
    Ok(Json(TouchResponse {
        new_timeout_at: message.locked_until.map(|t| t.timestamp()),
        lock_token: message.lock_token,
    }))
}
