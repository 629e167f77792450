//! Activity, anomaly and consumer-statistics endpoints.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use relay_common::{
    ActivityAction, ActivityLogEntry, Anomaly, AnomalyRecord, AnomalySeverity, AnomalySummary,
    ConsumerStats, RelayError,
};
use relay_engine::{ActivityFilter, AnomalyFilter};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiResult, ErrorResponse};
use crate::model::{ActivityParams, AnomalyParams, ConsumerParams, Pagination};
use crate::AppState;

/// Client view of one activity row; timestamps are epoch seconds.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActivityEntryResponse {
    pub log_id: i64,
    pub timestamp: i64,
    #[schema(value_type = String)]
    pub action: ActivityAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub queue_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub anomaly: Option<Anomaly>,
}

impl From<ActivityLogEntry> for ActivityEntryResponse {
    fn from(entry: ActivityLogEntry) -> Self {
        Self {
            log_id: entry.log_id,
            timestamp: entry.timestamp.timestamp(),
            action: entry.action,
            message_id: entry.message_id,
            queue_name: entry.queue_name,
            consumer_id: entry.consumer_id,
            message_type: entry.message_type,
            context: entry.context,
            anomaly: entry.anomaly,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActivityPage {
    pub logs: Vec<ActivityEntryResponse>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AnomalyRecordResponse {
    pub anomaly_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<i64>,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub anomaly_type: String,
    #[schema(value_type = String)]
    pub severity: AnomalySeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    pub details: serde_json::Value,
}

impl From<AnomalyRecord> for AnomalyRecordResponse {
    fn from(record: AnomalyRecord) -> Self {
        Self {
            anomaly_id: record.anomaly_id,
            log_id: record.log_id,
            timestamp: record.timestamp.timestamp(),
            anomaly_type: record.anomaly_type,
            severity: record.severity,
            message_id: record.message_id,
            queue_name: record.queue_name,
            consumer_id: record.consumer_id,
            details: record.details,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AnomalyPage {
    pub anomalies: Vec<AnomalyRecordResponse>,
    #[schema(value_type = Object)]
    pub summary: AnomalySummary,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConsumerStatsResponse {
    pub consumer_id: String,
    pub total_dequeued: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dequeue_at: Option<i64>,
    pub anomaly_counts: std::collections::HashMap<String, i64>,
}

impl From<ConsumerStats> for ConsumerStatsResponse {
    fn from(stats: ConsumerStats) -> Self {
        Self {
            consumer_id: stats.consumer_id,
            total_dequeued: stats.total_dequeued,
            last_dequeue_at: stats.last_dequeue_at.map(|t| t.timestamp()),
            anomaly_counts: stats.anomaly_counts,
        }
    }
}

/// Activity feed, newest first.
#[utoipa::path(
    get,
    path = "/queue/activity",
    tag = "Activity",
    responses((status = 200, description = "Activity rows with pagination", body = ActivityPage))
)]
pub async fn activity(
    State(state): State<AppState>,
    Query(params): Query<ActivityParams>,
) -> ApiResult<Json<ActivityPage>> {
    let action = match &params.action {
        Some(raw) => Some(
            ActivityAction::parse(raw)
                .ok_or_else(|| RelayError::InvalidArgument(format!("unknown action: {raw}")))?,
        ),
        None => None,
    };

    let page = params.page.unwrap_or(0);
    let size = params.size.unwrap_or(50);
    let (entries, total) = state
        .engine
        .get_activity_logs(
            ActivityFilter {
                queue_name: params.queue_name,
                action,
                consumer_id: params.consumer_id,
                message_type: params.message_type,
            },
            page,
            size,
        )
        .await?;

    Ok(Json(ActivityPage {
        logs: entries.into_iter().map(Into::into).collect(),
        pagination: Pagination { page, size, total },
    }))
}

/// Chronological audit trail of one message.
#[utoipa::path(
    get,
    path = "/queue/activity/message/{id}",
    tag = "Activity",
    responses((status = 200, description = "History, oldest first", body = [ActivityEntryResponse]))
)]
pub async fn message_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ActivityEntryResponse>>> {
    let history = state.engine.get_message_history(&id).await?;
    Ok(Json(history.into_iter().map(Into::into).collect()))
}

/// Anomaly listing with an aggregate summary.
#[utoipa::path(
    get,
    path = "/queue/activity/anomalies",
    tag = "Activity",
    responses(
        (status = 200, description = "Anomalies and summary", body = AnomalyPage),
        (status = 400, description = "Unknown severity", body = ErrorResponse)
    )
)]
pub async fn anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomalyParams>,
) -> ApiResult<Json<AnomalyPage>> {
    let severity = match &params.severity {
        Some(raw) => Some(
            AnomalySeverity::parse(raw)
                .ok_or_else(|| RelayError::InvalidArgument(format!("unknown severity: {raw}")))?,
        ),
        None => None,
    };
    let ascending = params.sort.as_deref() == Some("asc");

    let (records, summary) = state
        .engine
        .get_anomalies(
            AnomalyFilter {
                anomaly_type: params.anomaly_type,
                severity,
                queue_name: params.queue_name,
                consumer_id: params.consumer_id,
            },
            ascending,
            params.page.unwrap_or(0),
            params.size.unwrap_or(50),
        )
        .await?;

    Ok(Json(AnomalyPage {
        anomalies: records.into_iter().map(Into::into).collect(),
        summary,
    }))
}

/// Per-consumer statistics.
#[utoipa::path(
    get,
    path = "/queue/activity/consumers",
    tag = "Activity",
    responses((status = 200, description = "Consumer counters", body = [ConsumerStatsResponse]))
)]
pub async fn consumers(
    State(state): State<AppState>,
    Query(params): Query<ConsumerParams>,
) -> ApiResult<Json<Vec<ConsumerStatsResponse>>> {
    let stats = state
        .engine
        .get_consumer_stats(params.consumer_id.as_deref())
        .await?;
    Ok(Json(stats.into_iter().map(Into::into).collect()))
}
