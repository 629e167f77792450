//! HTTP error mapping.
//!
//! The fencing contract is bit-exact: a completion call with a stale lock
//! token answers 409 with body `{"error":"LOCK_LOST","message":…}` and no
//! state change.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use relay_common::{RelayError, StoreError};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Wrapper giving every engine error an HTTP rendering.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::NotFound(_) | RelayError::QueueNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::LockLost(_) => StatusCode::CONFLICT,
            RelayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RelayError::AlreadyExists(_) | RelayError::Conflict(_) => StatusCode::CONFLICT,
            RelayError::Store(StoreError::Transient(_)) | RelayError::Store(StoreError::Failure(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_lost_maps_to_409_with_exact_code() {
        let response = ApiError(RelayError::LockLost("m1".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError(RelayError::NotFound("m1".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError(RelayError::QueueNotFound("q".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_maps_to_400() {
        let response = ApiError(RelayError::invalid("bad priority")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_conflicts_map_to_409() {
        let response = ApiError(RelayError::AlreadyExists("q".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = ApiError(RelayError::conflict("terminal")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_store_failures_map_to_500() {
        let response =
            ApiError(RelayError::Store(StoreError::Failure("db down".into()))).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
