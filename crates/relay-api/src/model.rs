//! Request and response bodies.
//!
//! Client-visible timestamps are integer seconds since epoch. Query and
//! body field names accept both camelCase (the wire convention) and
//! snake_case.

use chrono::{DateTime, Utc};
use relay_common::{Message, MessageStatus, NewMessage, QueueCounts, QueueInfo, QueueType};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default, alias = "ackTimeout", alias = "ackTimeoutSeconds")]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default, alias = "maxAttempts")]
    pub max_attempts: Option<i32>,
    #[serde(default, alias = "queueName")]
    pub queue: Option<String>,
}

impl From<EnqueueRequest> for NewMessage {
    fn from(request: EnqueueRequest) -> Self {
        NewMessage {
            message_type: request.message_type,
            payload: request.payload,
            priority: request.priority,
            ack_timeout_seconds: request.ack_timeout_seconds,
            max_attempts: request.max_attempts,
            queue: request.queue,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueResponse {
    pub id: String,
    pub queue: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchEnqueueRequest {
    pub messages: Vec<EnqueueRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchEnqueueResponse {
    pub count: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DequeueParams {
    /// Seconds to wait for a runnable message; 0 returns immediately.
    #[serde(default, alias = "timeoutSeconds")]
    pub timeout: Option<u64>,
    #[serde(default, alias = "ackTimeout")]
    pub ack_timeout: Option<i64>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default, alias = "consumerId")]
    pub consumer_id: Option<String>,
    #[serde(default, alias = "queueName")]
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AckRequest {
    #[serde(alias = "id", alias = "messageId")]
    pub message_id: String,
    #[serde(alias = "lockToken")]
    pub lock_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NackRequest {
    #[serde(alias = "lockToken")]
    pub lock_token: String,
    #[serde(default, alias = "errorReason")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TouchRequest {
    #[serde(alias = "lockToken")]
    pub lock_token: String,
    #[serde(default, alias = "extendSeconds")]
    pub extend_seconds: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TouchResponse {
    /// New lock deadline, seconds since epoch.
    pub new_timeout_at: Option<i64>,
    pub lock_token: Option<String>,
}

/// Client-facing view of a message.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub id: String,
    pub queue: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: MessageStatus,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dequeued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub payload_size: i64,
}

fn epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            queue: message.queue_name,
            message_type: message.message_type,
            payload: message.payload,
            priority: message.priority,
            status: message.status,
            attempt_count: message.attempt_count,
            max_attempts: message.max_attempts,
            ack_timeout_seconds: message.ack_timeout_seconds,
            lock_token: message.lock_token,
            locked_until: message.locked_until.map(epoch),
            consumer_id: message.consumer_id,
            created_at: epoch(message.created_at),
            dequeued_at: message.dequeued_at.map(epoch),
            acknowledged_at: message.acknowledged_at.map(epoch),
            last_error: message.last_error,
            payload_size: message.payload_size,
        }
    }
}

// ============================================================================
// Admin
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveRequestBody {
    #[serde(default, alias = "messageIds")]
    pub message_ids: Option<Vec<String>>,
    #[serde(default, alias = "sourceQueue")]
    pub source_queue: Option<String>,
    #[serde(default, alias = "sourceStatus")]
    pub source_status: Option<MessageStatus>,
    #[serde(default, alias = "destQueue", alias = "targetQueue")]
    pub dest_queue: Option<String>,
    #[serde(default, alias = "destStatus", alias = "targetStatus")]
    pub dest_status: Option<MessageStatus>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MoveResponse {
    #[serde(rename = "movedCount")]
    pub moved_count: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusParams {
    #[serde(default, alias = "includeMessages")]
    pub include_messages: Option<bool>,
    #[serde(default, alias = "queueName", alias = "queue")]
    pub queue_name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListMessagesParams {
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default, alias = "consumerId")]
    pub consumer_id: Option<String>,
    /// "priority" for dequeue order; anything else sorts newest first.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default, alias = "limit")]
    pub size: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessagesPage {
    pub messages: Vec<MessageResponse>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClearParams {
    #[serde(default)]
    pub status: Option<MessageStatus>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearResponse {
    pub cleared: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteParams {
    /// Accepted for wire compatibility; deletion locates the message in
    /// whichever table holds it.
    #[serde(default, alias = "queueType")]
    pub queue_type: Option<String>,
}

// ============================================================================
// Queue registry
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateQueueRequest {
    pub name: String,
    #[serde(default, alias = "queueType")]
    pub queue_type: Option<QueueType>,
    #[serde(default, alias = "ackTimeoutSeconds")]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default, alias = "maxAttempts")]
    pub max_attempts: Option<i32>,
    #[serde(default, alias = "partitionIntervalSeconds")]
    pub partition_interval_seconds: Option<i64>,
    #[serde(default, alias = "retentionIntervalSeconds")]
    pub retention_interval_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateQueueRequest {
    #[serde(default, alias = "ackTimeoutSeconds")]
    pub ack_timeout_seconds: Option<i64>,
    #[serde(default, alias = "maxAttempts")]
    pub max_attempts: Option<i32>,
    #[serde(default, alias = "retentionIntervalSeconds")]
    pub retention_interval_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteQueueParams {
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueResponse {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: i64,
    pub max_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_interval_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_interval_seconds: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<QueueCounts>,
}

impl QueueResponse {
    pub fn from_info(info: QueueInfo, counts: Option<QueueCounts>) -> Self {
        Self {
            name: info.name,
            queue_type: info.queue_type,
            ack_timeout_seconds: info.ack_timeout_seconds,
            max_attempts: info.max_attempts,
            partition_interval_seconds: info.partition_interval_seconds,
            retention_interval_seconds: info.retention_interval_seconds,
            created_at: epoch(info.created_at),
            updated_at: epoch(info.updated_at),
            counts,
        }
    }
}

// ============================================================================
// Activity
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActivityParams {
    #[serde(default, alias = "queueName", alias = "queue")]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, alias = "consumerId")]
    pub consumer_id: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default, alias = "limit")]
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnomalyParams {
    #[serde(default, rename = "type")]
    pub anomaly_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, alias = "queueName", alias = "queue")]
    pub queue_name: Option<String>,
    #[serde(default, alias = "consumerId")]
    pub consumer_id: Option<String>,
    /// "asc" or "desc" (default) by timestamp.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default, alias = "limit")]
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsumerParams {
    #[serde(default, alias = "consumerId")]
    pub consumer_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::MessageStatus;

    #[test]
    fn test_message_response_uses_epoch_seconds() {
        let now = Utc::now();
        let message = Message {
            id: "0000000000001".to_string(),
            queue_name: "default".to_string(),
            message_type: "job".to_string(),
            payload: serde_json::json!({"k": "v"}),
            priority: 3,
            status: MessageStatus::Processing,
            attempt_count: 1,
            max_attempts: None,
            ack_timeout_seconds: None,
            lock_token: Some("token".to_string()),
            locked_until: Some(now),
            consumer_id: None,
            created_at: now,
            dequeued_at: Some(now),
            acknowledged_at: None,
            last_error: None,
            payload_size: 10,
        };

        let response = MessageResponse::from(message);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["created_at"], now.timestamp());
        assert_eq!(value["locked_until"], now.timestamp());
        assert_eq!(value["type"], "job");
        assert!(value.get("acknowledged_at").is_none());
    }

    #[test]
    fn test_requests_accept_camel_case_aliases() {
        let ack: AckRequest =
            serde_json::from_str(r#"{"messageId": "m1", "lockToken": "t1"}"#).unwrap();
        assert_eq!(ack.message_id, "m1");
        assert_eq!(ack.lock_token, "t1");

        let touch: TouchRequest =
            serde_json::from_str(r#"{"lock_token": "t1", "extendSeconds": 30}"#).unwrap();
        assert_eq!(touch.extend_seconds, Some(30));

        let enqueue: EnqueueRequest = serde_json::from_str(
            r#"{"type": "job", "payload": {}, "ackTimeout": 15, "queueName": "work"}"#,
        )
        .unwrap();
        assert_eq!(enqueue.ack_timeout_seconds, Some(15));
        assert_eq!(enqueue.queue.as_deref(), Some("work"));
    }
}
