// SPDX-License-Identifier: Apache-2.0

//! Lock-free operational counters.
//!
//! Process-wide atomics; a snapshot is logged on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct GatewayMetrics {
    requests: AtomicU64,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    pool_unavailable: AtomicU64,
    truncated: AtomicU64,
    audit_write_failures: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static GATEWAY_METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

fn metrics() -> &'static GatewayMetrics {
    GATEWAY_METRICS.get_or_init(GatewayMetrics::default)
}

/// How a request ended, as far as the counters are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { truncated: bool },
    Rejected,
    Timeout,
    PoolUnavailable,
    Failed,
}

pub fn record_request(duration_ms: f64, outcome: RequestOutcome) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.requests.fetch_add(1, Ordering::Relaxed);

    let counter = match outcome {
        RequestOutcome::Success { truncated } => {
            if truncated {
                metrics.truncated.fetch_add(1, Ordering::Relaxed);
            }
            &metrics.succeeded
        }
        RequestOutcome::Rejected => &metrics.rejected,
        RequestOutcome::Timeout => &metrics.timeouts,
        RequestOutcome::PoolUnavailable => &metrics.pool_unavailable,
        RequestOutcome::Failed => &metrics.failed,
    };
    counter.fetch_add(1, Ordering::Relaxed);

    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);

    let mut current = metrics.duration_max_ms.load(Ordering::Relaxed);
    while duration_ms > current {
        match metrics.duration_max_ms.compare_exchange(
            current,
            duration_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

pub fn record_audit_failure() {
    metrics().audit_write_failures.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub rejected: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub pool_unavailable: u64,
    pub truncated: u64,
    pub audit_write_failures: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> MetricsSnapshot {
    let metrics = metrics();
    let requests = metrics.requests.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    MetricsSnapshot {
        requests,
        succeeded: metrics.succeeded.load(Ordering::Relaxed),
        rejected: metrics.rejected.load(Ordering::Relaxed),
        failed: metrics.failed.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        pool_unavailable: metrics.pool_unavailable.load(Ordering::Relaxed),
        truncated: metrics.truncated.load(Ordering::Relaxed),
        audit_write_failures: metrics.audit_write_failures.load(Ordering::Relaxed),
        avg_ms: if requests > 0 {
            Some(duration_total as f64 / requests as f64)
        } else {
            None
        },
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flow() {
        // other tests share the counters, so only deltas are asserted
        let initial = snapshot();

        record_request(12.0, RequestOutcome::Success { truncated: true });
        let s1 = snapshot();
        assert!(s1.requests > initial.requests);
        assert!(s1.succeeded > initial.succeeded);
        assert!(s1.truncated > initial.truncated);

        record_request(1.0, RequestOutcome::Rejected);
        record_request(30_000.0, RequestOutcome::Timeout);
        let s2 = snapshot();
        assert!(s2.rejected > s1.rejected);
        assert!(s2.timeouts > s1.timeouts);
        assert!(s2.max_ms.unwrap() >= 30_000);

        record_audit_failure();
        assert!(snapshot().audit_write_failures > initial.audit_write_failures);
    }
}
