use thiserror::Error;

/// Store-level failure classification.
///
/// Transient errors are retried internally with capped backoff; once the cap
/// is exhausted they surface as `Failure`.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Failure(String),
}

/// Broker error taxonomy. Component functions return these by value; the
/// HTTP layer maps each kind to a status code.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Fencing-token mismatch. Never retried; the caller must discard its
    /// work for this message.
    #[error("lock lost for message {0}")]
    LockLost(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            RelayError::LockLost(_) => "LOCK_LOST",
            RelayError::InvalidArgument(_) => "INVALID_ARGUMENT",
            RelayError::AlreadyExists(_) => "ALREADY_EXISTS",
            RelayError::Conflict(_) => "CONFLICT",
            RelayError::Store(StoreError::Transient(_)) => "STORE_TRANSIENT",
            RelayError::Store(StoreError::Failure(_)) => "STORE_FAILURE",
            RelayError::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(RelayError::LockLost("m".into()).code(), "LOCK_LOST");
        assert_eq!(RelayError::NotFound("m".into()).code(), "NOT_FOUND");
        assert_eq!(
            RelayError::Store(StoreError::Failure("db".into())).code(),
            "STORE_FAILURE"
        );
    }

    #[test]
    fn test_store_error_propagates() {
        fn inner() -> Result<(), StoreError> {
            Err(StoreError::Transient("connection reset".into()))
        }
        fn outer() -> Result<(), RelayError> {
            inner()?;
            Ok(())
        }
        assert!(matches!(
            outer(),
            Err(RelayError::Store(StoreError::Transient(_)))
        ));
    }
}
