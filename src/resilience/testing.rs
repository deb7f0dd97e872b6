//! Chaos testing tools for circuit breakers
//!
//! Drives a breaker with simulated calls that fail, stall or time out at
//! configurable rates and reports what the breaker did with them.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::circuit_breaker::CircuitBreaker;
use super::error::BreakerError;
use super::state::{BreakerMetrics, CircuitStatus};

/// Chaos testing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosTestingConfig {
    /// Failure rate (0.0 - 1.0)
    pub failure_rate: f64,
    /// Whether to inject failures
    pub inject_failures: bool,
    /// Latency added to every simulated call in milliseconds
    pub latency_ms: u64,
    /// Whether to inject latency
    pub inject_latency: bool,
    /// Rate of calls that outlive the breaker timeout (0.0 - 1.0)
    pub timeout_rate: f64,
    /// Whether to inject timeouts
    pub inject_timeouts: bool,
    /// Pause between consecutive calls in milliseconds
    pub request_interval_ms: u64,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for ChaosTestingConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.2,
            inject_failures: false,
            latency_ms: 100,
            inject_latency: false,
            timeout_rate: 0.1,
            inject_timeouts: false,
            request_interval_ms: 0,
            seed: None,
        }
    }
}

/// Outcome of a chaos run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChaosTestResult {
    /// Breaker name
    pub breaker: String,
    /// Run duration in milliseconds
    pub duration_ms: u64,
    /// Number of calls issued
    pub request_count: u64,
    /// Calls that reached the operation and succeeded
    pub success_count: u64,
    /// Calls that reached the operation and failed
    pub failure_count: u64,
    /// Calls that exceeded the breaker timeout
    pub timeout_count: u64,
    /// Calls rejected by the open circuit
    pub rejected_count: u64,
    /// Calls served by the fallback
    pub fallback_count: u64,
    /// Status after the run
    pub final_status: CircuitStatus,
    /// Breaker metrics after the run
    pub metrics: BreakerMetrics,
}

/// What a simulated call will do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Injection {
    Succeed,
    Fail,
    Stall,
}

/// Circuit breaker tester
pub struct CircuitBreakerTester {
    /// Breaker under test
    breaker: CircuitBreaker<serde_json::Value>,
    /// Chaos testing configuration
    config: Mutex<ChaosTestingConfig>,
    /// Random number generator
    rng: Mutex<StdRng>,
}

impl CircuitBreakerTester {
    /// Create a new circuit breaker tester
    pub fn new(breaker: CircuitBreaker<serde_json::Value>, config: ChaosTestingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            breaker,
            config: Mutex::new(config),
            rng: Mutex::new(rng),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<serde_json::Value> {
        &self.breaker
    }

    /// Update chaos testing configuration
    pub async fn update_config(&self, config: ChaosTestingConfig) {
        if let Some(seed) = config.seed {
            *self.rng.lock().await = StdRng::seed_from_u64(seed);
        }
        *self.config.lock().await = config;
    }

    /// Run a test with a specified number of requests
    pub async fn run_test(&self, request_count: u64) -> Result<ChaosTestResult> {
        let config = self.config.lock().await.clone();
        let started = Instant::now();

        let mut success_count = 0;
        let mut failure_count = 0;
        let mut timeout_count = 0;
        let mut rejected_count = 0;
        let mut fallback_count = 0;

        for request in 0..request_count {
            if request > 0 && config.request_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.request_interval_ms)).await;
            }

            let injection = self.next_injection(&config).await;
            let latency = self.latency_for(&config, injection);

            let mut invoked = false;
            let result = self
                .breaker
                .execute(|| {
                    invoked = true;
                    simulate_call(request, injection, latency)
                })
                .await;

            match result {
                Ok(_) if invoked => success_count += 1,
                Ok(_) => fallback_count += 1,
                Err(BreakerError::Timeout { .. }) => timeout_count += 1,
                Err(BreakerError::CircuitOpen { .. }) | Err(BreakerError::Fallback { .. }) => {
                    rejected_count += 1
                }
                Err(BreakerError::Operation(e)) => {
                    debug!("Simulated call {} failed: {}", request, e);
                    failure_count += 1;
                }
            }
        }

        let metrics = self.breaker.metrics().await;
        let result = ChaosTestResult {
            breaker: self.breaker.name().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            request_count,
            success_count,
            failure_count,
            timeout_count,
            rejected_count,
            fallback_count,
            final_status: metrics.status,
            metrics,
        };

        info!(
            "Chaos run against {} finished: {} ok, {} failed, {} timed out, {} rejected, {} fallbacks, final status {}",
            result.breaker,
            result.success_count,
            result.failure_count,
            result.timeout_count,
            result.rejected_count,
            result.fallback_count,
            result.final_status
        );

        Ok(result)
    }

    /// Verify that the breaker opens under sustained failure and recovers
    /// once the dependency is healthy again
    pub async fn verify_recovery(&self) -> Result<bool> {
        let original = self.config.lock().await.clone();
        let options = self.breaker.options();
        let failing_calls = u64::from(options.failure_threshold.max(options.volume_threshold));
        let reset_timeout = options.reset_timeout;

        self.update_config(ChaosTestingConfig {
            failure_rate: 1.0,
            inject_failures: true,
            request_interval_ms: 0,
            ..original.clone()
        })
        .await;
        let result = self.run_test(failing_calls).await?;

        if result.final_status != CircuitStatus::Open {
            self.update_config(original).await;
            return Ok(false);
        }

        self.update_config(ChaosTestingConfig {
            failure_rate: 0.0,
            inject_failures: false,
            inject_timeouts: false,
            request_interval_ms: 0,
            ..original.clone()
        })
        .await;

        // Let the reset timer fire before probing
        tokio::time::sleep(reset_timeout + Duration::from_millis(1)).await;
        let result = self.run_test(1).await?;

        self.update_config(original).await;
        Ok(result.final_status == CircuitStatus::Closed)
    }

    async fn next_injection(&self, config: &ChaosTestingConfig) -> Injection {
        let mut rng = self.rng.lock().await;

        if config.inject_timeouts && rng.gen_bool(config.timeout_rate.clamp(0.0, 1.0)) {
            Injection::Stall
        } else if config.inject_failures && rng.gen_bool(config.failure_rate.clamp(0.0, 1.0)) {
            Injection::Fail
        } else {
            Injection::Succeed
        }
    }

    fn latency_for(&self, config: &ChaosTestingConfig, injection: Injection) -> Duration {
        match injection {
            // Outlive the breaker deadline
            Injection::Stall => self.breaker.options().timeout + Duration::from_millis(1),
            _ if config.inject_latency => Duration::from_millis(config.latency_ms),
            _ => Duration::ZERO,
        }
    }
}

async fn simulate_call(
    request: u64,
    injection: Injection,
    latency: Duration,
) -> Result<serde_json::Value> {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }

    match injection {
        Injection::Fail => Err(anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "simulated connection failure",
        ))),
        _ => Ok(serde_json::json!({ "request": request, "ok": true })),
    }
}
