//! PostgreSQL store adapter.
//!
//! Owns the connection pool and the low-level access patterns every other
//! component borrows: transactions with a chosen isolation level, transient
//! error retry with capped backoff, `LISTEN/NOTIFY` subscription, advisory
//! locks, and the idempotent schema bootstrap.

use relay_common::{RelayError, StoreError};
use relay_config::StoreConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub mod advisory;
pub mod listener;
pub mod schema;

pub use advisory::AdvisoryGuard;
pub use listener::NotificationHub;

/// Transaction isolation required by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    Serializable,
}

/// Retry schedule for transient store errors.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Typed access to the durable store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect a pool with the configured size and statement timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let statement_timeout_ms = config.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {}", statement_timeout_ms))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.database_url)
            .await
            .map_err(classify)?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction at the requested isolation level.
    pub async fn begin(
        &self,
        isolation: Isolation,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        if isolation == Isolation::Serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        Ok(tx)
    }

    /// Publish a payload on a notification channel.
    pub async fn notify<'e, E>(executor: E, channel: &str, payload: &str) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(executor)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Bootstrap the schema. Safe to run on every start.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        schema::bootstrap(&self.pool).await
    }
}

/// Classify an sqlx error into the transient/permanent split.
///
/// Transient: connection-level failures, pool timeouts, deadlock (40P01)
/// and serialization (40001) aborts.
pub fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") | Some("57P03") | Some("08006") | Some("08001") => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Failure(err.to_string()),
        },
        _ => StoreError::Failure(err.to_string()),
    }
}

/// Run an operation, retrying transient store errors with bounded
/// exponential backoff. Permanent errors and exhausted retries surface as
/// `StoreError::Failure`.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(err) {
                StoreError::Transient(reason) if attempt < RETRY_MAX_ATTEMPTS => {
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                StoreError::Transient(reason) => {
                    debug!(op = op_name, attempt, "Retry cap exhausted");
                    return Err(StoreError::Failure(format!(
                        "{op_name}: retries exhausted: {reason}"
                    )));
                }
                permanent => return Err(permanent),
            },
        }
    }
}

/// Retry wrapper for multi-statement transactions that surface domain
/// errors. Only `RelayError::Store(StoreError::Transient)` is retried, with
/// the same backoff schedule as [`with_retry`]; every other error (not
/// found, lock lost, validation) passes through untouched. The operation
/// must be a whole transaction: a failed attempt has rolled back before the
/// next one starts.
pub async fn with_tx_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RelayError::Store(StoreError::Transient(reason))) => {
                if attempt < RETRY_MAX_ATTEMPTS {
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Transient store error, retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                } else {
                    debug!(op = op_name, attempt, "Retry cap exhausted");
                    return Err(RelayError::Store(StoreError::Failure(format!(
                        "{op_name}: retries exhausted: {reason}"
                    ))));
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_gives_up_after_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Failure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_with_retry_passes_through_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, sqlx::Error>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Failure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tx_retry_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_tx_retry("test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(RelayError::Store(StoreError::Transient("deadlock".into())))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tx_retry_passes_domain_errors_through() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RelayError> = with_tx_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RelayError::LockLost("m1".into())) }
        })
        .await;

        assert!(matches!(result, Err(RelayError::LockLost(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tx_retry_exhaustion_surfaces_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RelayError> = with_tx_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RelayError::Store(StoreError::Transient("reset".into()))) }
        })
        .await;

        assert!(matches!(
            result,
            Err(RelayError::Store(StoreError::Failure(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_MAX_ATTEMPTS);
    }
}
