use std::sync::Once;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::resilience::{BreakerMetrics, ChaosTestResult, SystemHealth};

static INIT: Once = Once::new();

/// Initialize the logging system
///
/// Honors `RUST_LOG`, defaulting to `info`. Logs go to stderr so command
/// output on stdout stays machine readable.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // Another subscriber may already be installed by the host application
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}

/// Log a breaker metrics snapshot
pub fn log_breaker_metrics(name: &str, metrics: &BreakerMetrics) {
    info!(
        "Circuit breaker {}: status {}, {} requests, {:.1}% failures, avg {:.1}ms, opened {} times",
        name,
        metrics.status,
        metrics.total_requests,
        metrics.failure_rate,
        metrics.average_response_time_ms,
        metrics.total_circuit_opens
    );
}

/// Log a chaos run summary
pub fn log_chaos_result(result: &ChaosTestResult) {
    info!(
        "Simulated {} requests against {} in {}ms",
        result.request_count, result.breaker, result.duration_ms
    );
    log_breaker_metrics(&result.breaker, &result.metrics);
}

/// Log system health
pub fn log_system_health(health: &SystemHealth) {
    if health.healthy {
        info!(
            "System healthy: {} circuit breakers closed or probing",
            health.total_breakers
        );
    } else {
        warn!(
            "System degraded: open circuit breakers {}",
            health.open_breakers.join(", ")
        );
    }
}
