//! Guarded store access.
//!
//! Every store operation goes through [`StoreGuard::run`]:
//!
//! 1. A connection is acquired within `acquire_timeout`, else the call fails
//!    with [`Error::StoreUnavailable`].
//! 2. The connection is held by a [`PooledConnection`] lease which releases it
//!    on drop, so success, error, cancellation and unwinding all return it.
//! 3. A watchdog logs a warning once the operation runs past
//!    `watchdog_timeout`. The watchdog never cancels the operation.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::warn;

use super::pool::ConnectionPool;
use crate::config::StoreConfig;
use crate::{Error, Result};

/// Connection lease that releases back to its pool on drop
pub struct PooledConnection<'a, P: ConnectionPool> {
    pool: &'a P,
    conn: Option<P::Connection>,
}

impl<'a, P: ConnectionPool> PooledConnection<'a, P> {
    fn new(pool: &'a P, conn: P::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl<P: ConnectionPool> Deref for PooledConnection<'_, P> {
    type Target = P::Connection;

    fn deref(&self) -> &P::Connection {
        // Only taken in Drop
        self.conn.as_ref().expect("connection is held until the lease drops")
    }
}

impl<P: ConnectionPool> Drop for PooledConnection<'_, P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Bounded-time, always-releasing, watchdog-observed store access
pub struct StoreGuard<P: ConnectionPool> {
    pool: Arc<P>,
    acquire_timeout: Duration,
    watchdog_timeout: Duration,
    slow_operations: AtomicU64,
}

impl<P: ConnectionPool> StoreGuard<P> {
    /// Create a guard over `pool`
    #[must_use]
    pub fn new(pool: Arc<P>, config: &StoreConfig) -> Self {
        Self {
            pool,
            acquire_timeout: config.acquire_timeout,
            watchdog_timeout: config.watchdog_timeout,
            slow_operations: AtomicU64::new(0),
        }
    }

    /// The guarded pool
    #[must_use]
    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Operations that tripped the watchdog so far
    #[must_use]
    pub fn slow_operations(&self) -> u64 {
        self.slow_operations.load(Ordering::Relaxed)
    }

    /// Run `op` on a pooled connection.
    ///
    /// `description` names the operation in diagnostics.
    pub async fn run<T, F>(&self, description: &str, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c P::Connection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let conn = match tokio::time::timeout(self.acquire_timeout, self.pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                telemetry_metrics::counter!("function_watcher_store_failures_total").increment(1);
                return Err(e);
            }
            Err(_) => {
                telemetry_metrics::counter!("function_watcher_store_failures_total").increment(1);
                return Err(Error::StoreUnavailable(format!(
                    "{description}: no connection within {}ms",
                    self.acquire_timeout.as_millis()
                )));
            }
        };
        let lease = PooledConnection::new(self.pool.as_ref(), conn);

        let conn: &P::Connection = &lease;
        let started = Instant::now();
        let mut operation = op(conn);
        let watchdog = tokio::time::sleep(self.watchdog_timeout);
        tokio::pin!(watchdog);

        let result = tokio::select! {
            result = &mut operation => result,
            () = &mut watchdog => {
                self.slow_operations.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("function_watcher_store_slow_operations_total")
                    .increment(1);
                warn!(
                    operation = description,
                    "{description} delayed. Waiting over {} seconds.",
                    self.watchdog_timeout.as_secs_f64()
                );
                let result = operation.await;
                warn!(
                    operation = description,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Delayed store operation finished"
                );
                result
            }
        };

        if result.is_err() {
            telemetry_metrics::counter!("function_watcher_store_failures_total").increment(1);
        }
        result
    }
}
