//! Admin endpoints: metrics, status, listings, move, delete, clear.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use relay_engine::{MessageFilter, MessageSort, MoveRequest, QueueStatusEntry};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiResult, ErrorResponse};
use crate::model::{
    ClearParams, ClearResponse, DeleteParams, ListMessagesParams, MessageResponse, MessagesPage,
    MoveRequestBody, MoveResponse, Pagination, StatusParams,
};
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    #[schema(value_type = Vec<Object>)]
    pub queues: Vec<QueueStatusEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessageResponse>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

/// Store-derived lifecycle counters.
#[utoipa::path(
    get,
    path = "/queue/metrics",
    tag = "Admin",
    responses((status = 200, description = "Counters by status and registry totals"))
)]
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let counters = state.engine.broker_counters().await?;
    Ok(Json(serde_json::to_value(counters).unwrap_or_default()))
}

/// Per-queue status rollup, optionally with messages attached.
#[utoipa::path(
    get,
    path = "/queue/status",
    tag = "Admin",
    responses((status = 200, description = "Queues with row counts", body = StatusResponse))
)]
pub async fn status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Json<StatusResponse>> {
    let report = state
        .engine
        .queue_status(
            params.queue_name.as_deref(),
            params.include_messages.unwrap_or(false),
        )
        .await?;

    Ok(Json(StatusResponse {
        queues: report.queues,
        messages: report
            .messages
            .map(|messages| messages.into_iter().map(MessageResponse::from).collect()),
    }))
}

/// Page through one queue's messages.
#[utoipa::path(
    get,
    path = "/queue/{queueName}/messages",
    tag = "Admin",
    responses(
        (status = 200, description = "Messages with pagination", body = MessagesPage),
        (status = 404, description = "Queue not found", body = ErrorResponse)
    )
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    Query(params): Query<ListMessagesParams>,
) -> ApiResult<Json<MessagesPage>> {
    let queue = state.engine.get_queue(&queue_name).await?;
    let page = params.page.unwrap_or(0);
    let size = params.size.unwrap_or(20);

    let (messages, total) = state
        .engine
        .list_messages(
            &queue,
            MessageFilter {
                status: params.status,
                message_type: params.message_type,
                consumer_id: params.consumer_id,
                sort: match params.sort.as_deref() {
                    Some("priority") => MessageSort::Priority,
                    _ => MessageSort::CreatedAt,
                },
            },
            page,
            size,
        )
        .await?;

    Ok(Json(MessagesPage {
        messages: messages.into_iter().map(MessageResponse::from).collect(),
        pagination: Pagination { page, size, total },
    }))
}

/// Reparent messages across queues and statuses.
#[utoipa::path(
    post,
    path = "/queue/move",
    tag = "Admin",
    request_body = MoveRequestBody,
    responses((status = 200, description = "Number of messages moved", body = MoveResponse))
)]
pub async fn move_messages(
    State(state): State<AppState>,
    Json(request): Json<MoveRequestBody>,
) -> ApiResult<Json<MoveResponse>> {
    let moved_count = state
        .engine
        .move_messages(MoveRequest {
            message_ids: request.message_ids,
            source_queue: request.source_queue,
            source_status: request.source_status,
            dest_queue: request.dest_queue,
            dest_status: request.dest_status,
        })
        .await?;
    Ok(Json(MoveResponse { moved_count }))
}

/// Delete one message.
#[utoipa::path(
    delete,
    path = "/queue/message/{id}",
    tag = "Admin",
    responses(
        (status = 200, description = "Deleted", body = DeleteResponse),
        (status = 404, description = "Unknown message", body = ErrorResponse)
    )
)]
pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(_params): Query<DeleteParams>,
) -> ApiResult<Json<DeleteResponse>> {
    let message = state.engine.delete_message(&id).await?;
    Ok(Json(DeleteResponse {
        id: message.id,
        deleted: true,
    }))
}

/// Purge one queue, optionally restricted to a status.
#[utoipa::path(
    delete,
    path = "/queue/{queueName}/clear",
    tag = "Admin",
    responses((status = 200, description = "Rows removed", body = ClearResponse))
)]
pub async fn clear_queue(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    Query(params): Query<ClearParams>,
) -> ApiResult<Json<ClearResponse>> {
    let cleared = state
        .engine
        .purge(Some(&queue_name), params.status)
        .await?;
    Ok(Json(ClearResponse { cleared }))
}

/// Purge every queue.
#[utoipa::path(
    delete,
    path = "/queue/clear",
    tag = "Admin",
    responses((status = 200, description = "Rows removed", body = ClearResponse))
)]
pub async fn clear_all(
    State(state): State<AppState>,
    Query(params): Query<ClearParams>,
) -> ApiResult<Json<ClearResponse>> {
    let cleared = state.engine.purge(None, params.status).await?;
    Ok(Json(ClearResponse { cleared }))
}
