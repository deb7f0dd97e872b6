//! Breaker state and metrics model
//!
//! Plain data describing a breaker's current status and its rolling
//! statistics. Everything here is owned by a single [`CircuitBreaker`] and
//! handed out by copy.
//!
//! [`CircuitBreaker`]: super::CircuitBreaker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent call durations kept for the response time average
pub const RESPONSE_TIME_WINDOW: usize = 100;

/// Circuit status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Normal operation, calls pass through
    #[default]
    Closed,
    /// Dependency judged unhealthy, calls are rejected
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "closed"),
            CircuitStatus::Open => write!(f, "open"),
            CircuitStatus::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of a breaker's state record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct BreakerState {
    /// Current status
    pub status: CircuitStatus,
    /// Failures since the breaker last entered the closed state
    pub failure_count: u32,
    /// Failures in a row
    pub consecutive_failures: u32,
    /// Successes in a row
    pub consecutive_successes: u32,
    /// Time of the last counted failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Time of the last success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Calls admitted to the wrapped operation
    pub total_requests: u64,
    /// Counted failures
    pub total_failures: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Mean duration of the most recent calls (milliseconds)
    pub average_response_time_ms: f64,
}

/// Derived metrics for a breaker
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct BreakerMetrics {
    /// Current status
    pub status: CircuitStatus,
    /// Calls admitted to the wrapped operation
    pub total_requests: u64,
    /// Counted failures
    pub total_failures: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Successes as a percentage of total requests
    pub success_rate: f64,
    /// Failures as a percentage of total requests
    pub failure_rate: f64,
    /// Mean duration of the most recent calls (milliseconds)
    pub average_response_time_ms: f64,
    /// Time since the last failure while the circuit is open, zero otherwise
    pub circuit_open_time: Duration,
    /// Number of transitions into the open state
    pub total_circuit_opens: u64,
    /// Time of the most recent transition into the open state
    pub last_circuit_open: Option<DateTime<Utc>>,
}

/// Fixed-capacity window of call durations with a running sum.
#[derive(Clone, Debug, Default)]
pub struct ResponseTimeWindow {
    samples: VecDeque<f64>,
    sum: f64,
}

impl ResponseTimeWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            sum: 0.0,
        }
    }

    /// Add a sample, evicting the oldest one when full
    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;

        if self.samples.len() == RESPONSE_TIME_WINDOW {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }

        self.samples.push_back(ms);
        self.sum += ms;
    }

    /// Mean of the samples in the window (milliseconds)
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            // Running sums drift slightly under heavy eviction
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// Percentage of `part` in `total`, zero when nothing was observed
pub(crate) fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
