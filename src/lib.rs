// SPDX-License-Identifier: Apache-2.0

//! querygate - guarded read-only query gateway
//!
//! Wires the configuration, connection pool, audit log and executor together
//! and serves the JSON-lines transport on stdin/stdout.

pub mod audit;
pub mod commands;
pub mod config;
pub mod executor;
pub mod metrics;
pub mod observability;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use gate_core::{GateError, GateResult};
use gate_drivers::PostgresDriver;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use audit::{AuditRecorder, JsonlAuditLog};
use config::GatewayConfig;
use executor::GuardedExecutor;
use pool::ConnectionPool;

/// How long shutdown waits for checked-out connections
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds the audit recorder the policy asks for
pub fn build_audit_recorder(config: &GatewayConfig) -> GateResult<AuditRecorder> {
    if !config.policy.audit_enabled {
        info!("Audit logging disabled");
        return Ok(AuditRecorder::disabled());
    }

    let log = JsonlAuditLog::open(&config.audit_log_path).map_err(|e| {
        GateError::config(format!(
            "cannot open audit log {}: {}",
            config.audit_log_path.display(),
            e
        ))
    })?;
    info!(path = %log.path().display(), "Audit log opened");

    Ok(AuditRecorder::new(Arc::new(log), config.database.username.clone()))
}

/// Completes on the first interrupt; never completes if none can be observed
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, finishing in-flight requests"),
        Err(e) => {
            warn!("Cannot listen for interrupts: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Runs the gateway until stdin closes or an interrupt arrives
pub async fn run(config: GatewayConfig) -> GateResult<()> {
    let policy = Arc::new(config.policy.clone());
    let audit = build_audit_recorder(&config)?;
    let driver = Arc::new(PostgresDriver::new(config.postgres_config()));
    let pool = Arc::new(ConnectionPool::new(driver, config.pool, policy.timeout));
    let executor = Arc::new(GuardedExecutor::new(
        Arc::clone(&policy),
        Arc::clone(&pool),
        audit,
    ));

    let max_in_flight = config.pool.max_size as usize * 2;
    info!(
        host = %config.database.host,
        database = %config.database.database,
        max_rows = policy.max_rows,
        timeout_ms = policy.timeout_ms(),
        restricted = policy.is_restricted(),
        max_in_flight,
        "querygate started"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let served = commands::serve_until(
        executor,
        stdin,
        tokio::io::stdout(),
        max_in_flight,
        interrupted(),
    )
    .await;

    let stranded = pool.close(SHUTDOWN_GRACE).await;
    info!(
        metrics = ?metrics::snapshot(),
        pool = ?pool.status(),
        stranded,
        "querygate stopped"
    );

    served.map_err(|e| {
        error!("Transport failure: {}", e);
        GateError::internal(format!("transport failure: {}", e))
    })
}
