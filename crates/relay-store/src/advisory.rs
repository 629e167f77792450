//! Session advisory locks.
//!
//! The overdue-requeue worker must run at most once concurrently across the
//! deployment; each tick takes a session advisory lock on a fixed key and
//! holds it for the scan. The guard releases the lock on every exit path:
//! explicitly via [`AdvisoryGuard::release`], or by closing the underlying
//! connection on drop so the server frees the lock even if the holder
//! unwinds.

use relay_common::StoreError;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tracing::warn;

use crate::classify;

/// Deployment-wide key guarding the overdue-requeue sweep.
pub const REQUEUE_WORKER_LOCK_KEY: i64 = 0x52_45_4C_41_59_01;

/// Holds a session advisory lock on a dedicated pooled connection.
pub struct AdvisoryGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl AdvisoryGuard {
    /// Try to take the lock without blocking. Returns None when another
    /// session holds it.
    pub async fn try_acquire(pool: &PgPool, key: i64) -> Result<Option<Self>, StoreError> {
        let mut conn = pool.acquire().await.map_err(classify)?;

        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify)?;

        let acquired: bool = row.get("acquired");
        if acquired {
            Ok(Some(Self {
                conn: Some(conn),
                key,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release the lock and return the connection to the pool.
    pub async fn release(mut self) -> Result<(), StoreError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryGuard {
    fn drop(&mut self) {
        // A pooled connection returned with the lock still held would leak
        // it to the next borrower. Detach instead: the physical connection
        // closes and the server releases all its session locks.
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "Advisory lock guard dropped without release, closing connection");
            drop(conn.detach());
        }
    }
}
