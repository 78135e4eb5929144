// SPDX-License-Identifier: Apache-2.0

//! Connection Pool Manager
//!
//! A bb8 pool over any `DatabaseDriver`. Sessions are health-checked on
//! checkout; a session marked with `discard()` is closed instead of being
//! returned, and bb8 opens a replacement on a later acquisition.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bb8::{ErrorSink, ManageConnection, Pool, PooledConnection, RunError};
use gate_core::{DatabaseDriver, GateError, GateResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolSettings;

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A driver connection plus the flag bb8 consults on return
pub struct ManagedConnection<C> {
    conn: C,
    broken: bool,
}

/// Adapts a `DatabaseDriver` to bb8
pub struct DriverConnectionManager<D: DatabaseDriver> {
    driver: Arc<D>,
}

impl<D: DatabaseDriver> DriverConnectionManager<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }
}

impl<D: DatabaseDriver> ManageConnection for DriverConnectionManager<D> {
    type Connection = ManagedConnection<D::Connection>;
    type Error = GateError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.driver.connect().await?;
        debug!(driver = self.driver.driver_id(), "Opened pooled connection");
        Ok(ManagedConnection {
            conn,
            broken: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.driver.ping(&mut conn.conn).await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

/// Keeps the most recent connect failure so timeouts can explain themselves
#[derive(Clone, Default)]
struct LastConnectError(Arc<Mutex<Option<String>>>);

impl fmt::Debug for LastConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastConnectError").finish_non_exhaustive()
    }
}

impl ErrorSink<GateError> for LastConnectError {
    fn sink(&self, error: GateError) {
        warn!("Pooled connection attempt failed: {}", error);
        *self.0.lock() = Some(error.to_string());
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<GateError>> {
        Box::new(self.clone())
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
    pub max_size: u32,
}

pub struct ConnectionPool<D: DatabaseDriver> {
    pool: Pool<DriverConnectionManager<D>>,
    driver: Arc<D>,
    settings: PoolSettings,
    last_error: LastConnectError,
    closed: AtomicBool,
}

impl<D: DatabaseDriver> ConnectionPool<D> {
    /// Creates the pool without waiting for the database
    ///
    /// `min_idle` connections are opened in the background; an unreachable
    /// database surfaces as `ConnectTimeout` on acquisition.
    pub fn new(driver: Arc<D>, settings: PoolSettings, connect_timeout: Duration) -> Self {
        let last_error = LastConnectError::default();
        let pool = Pool::builder()
            .max_size(settings.max_size)
            .min_idle(Some(settings.min_idle))
            .connection_timeout(connect_timeout)
            .test_on_check_out(true)
            .retry_connection(true)
            .error_sink(Box::new(last_error.clone()))
            .build_unchecked(DriverConnectionManager::new(Arc::clone(&driver)));

        info!(
            driver = driver.driver_id(),
            min_idle = settings.min_idle,
            max_size = settings.max_size,
            "Connection pool created"
        );

        Self {
            pool,
            driver,
            settings,
            last_error,
            closed: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Checks out a session, waiting at most `wait`
    pub async fn acquire(&self, wait: Duration) -> GateResult<PooledSession<D>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GateError::internal("connection pool is closed"));
        }

        match timeout(wait, self.pool.get_owned()).await {
            Ok(Ok(conn)) => Ok(PooledSession { conn }),
            Ok(Err(RunError::User(e))) => Err(GateError::ConnectTimeout {
                timeout_ms: wait.as_millis() as u64,
                message: e.to_string(),
            }),
            Ok(Err(RunError::TimedOut)) | Err(_) => Err(self.unavailable(wait)),
        }
    }

    fn unavailable(&self, wait: Duration) -> GateError {
        let state = self.pool.state();
        let timeout_ms = wait.as_millis() as u64;

        if state.connections >= self.settings.max_size && state.idle_connections == 0 {
            warn!(max_size = self.settings.max_size, "Connection pool exhausted");
            GateError::PoolExhausted { timeout_ms }
        } else {
            let message = self
                .last_error
                .0
                .lock()
                .clone()
                .unwrap_or_else(|| "no connection could be established".to_string());
            GateError::ConnectTimeout {
                timeout_ms,
                message,
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            size: state.connections,
            idle: state.idle_connections,
            in_use: state.connections.saturating_sub(state.idle_connections),
            max_size: self.settings.max_size,
        }
    }

    /// Refuses new acquisitions and waits up to `grace` for sessions to return
    ///
    /// Returns the number of sessions still checked out when it gave up.
    pub async fn close(&self, grace: Duration) -> u32 {
        self.closed.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;

        loop {
            let in_use = self.status().in_use;
            if in_use == 0 {
                info!("Connection pool drained");
                return 0;
            }
            if Instant::now() >= deadline {
                warn!(in_use, "Closing pool with sessions still checked out");
                return in_use;
            }
            sleep(CLOSE_POLL_INTERVAL).await;
        }
    }
}

/// Exclusive use of one pooled connection; dropping it releases the connection
pub struct PooledSession<D: DatabaseDriver> {
    conn: PooledConnection<'static, DriverConnectionManager<D>>,
}

impl<D: DatabaseDriver> PooledSession<D> {
    pub fn connection(&mut self) -> &mut D::Connection {
        &mut self.conn.conn
    }

    /// Closes the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.conn.broken = true;
    }
}
