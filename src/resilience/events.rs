//! Breaker and manager notifications
//!
//! Each breaker and each manager owns its own `tokio::sync::broadcast`
//! channel. Subscribers receive a clone of every event emitted after they
//! subscribed; slow subscribers may observe `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::state::{BreakerMetrics, CircuitStatus};

/// Capacity of each breaker's event channel
pub const BREAKER_EVENT_CAPACITY: usize = 256;

/// Capacity of each manager's event channel
pub const MANAGER_EVENT_CAPACITY: usize = 1024;

/// Circuit breaker event type
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BreakerEventKind {
    /// A call arrived while the circuit was open
    CircuitOpen,
    /// The fallback produced a substitute result
    FallbackExecuted,
    /// The fallback itself failed
    FallbackFailed {
        /// Fallback error message
        error: String,
    },
    /// The wrapped operation succeeded
    Success {
        /// Call duration
        elapsed: Duration,
    },
    /// The wrapped operation failed or timed out
    Failure {
        /// Error message
        error: String,
        /// Call duration
        elapsed: Duration,
        /// Whether the failure counted toward the statistics
        counted: bool,
    },
    /// The circuit opened
    CircuitOpened {
        /// Failure count at the time of opening
        failure_count: u32,
    },
    /// The reset timeout elapsed and the circuit is probing
    CircuitHalfOpened,
    /// The circuit closed after a successful trial
    CircuitClosed,
    /// Periodic metrics snapshot
    Metrics {
        /// Current metrics
        metrics: BreakerMetrics,
    },
    /// Any status transition
    StateChange {
        /// Previous status
        from: CircuitStatus,
        /// New status
        to: CircuitStatus,
    },
    /// The circuit was opened manually
    CircuitForcedOpen,
    /// The circuit was closed manually
    CircuitForcedClosed,
    /// The breaker forgot its history
    CircuitReset,
}

impl BreakerEventKind {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerEventKind::CircuitOpen => "circuit-open",
            BreakerEventKind::FallbackExecuted => "fallback-executed",
            BreakerEventKind::FallbackFailed { .. } => "fallback-failed",
            BreakerEventKind::Success { .. } => "success",
            BreakerEventKind::Failure { .. } => "failure",
            BreakerEventKind::CircuitOpened { .. } => "circuit-opened",
            BreakerEventKind::CircuitHalfOpened => "circuit-half-opened",
            BreakerEventKind::CircuitClosed => "circuit-closed",
            BreakerEventKind::Metrics { .. } => "metrics",
            BreakerEventKind::StateChange { .. } => "state-change",
            BreakerEventKind::CircuitForcedOpen => "circuit-forced-open",
            BreakerEventKind::CircuitForcedClosed => "circuit-forced-closed",
            BreakerEventKind::CircuitReset => "circuit-reset",
        }
    }
}

/// Circuit breaker event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BreakerEvent {
    /// Event type
    pub kind: BreakerEventKind,
    /// Name of the emitting breaker
    pub breaker: String,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
}

impl BreakerEvent {
    pub fn new(breaker: &str, kind: BreakerEventKind) -> Self {
        Self {
            kind,
            breaker: breaker.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate health of every registered breaker
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SystemHealth {
    /// True iff no breaker is open
    pub healthy: bool,
    /// Names of the open breakers, sorted
    pub open_breakers: Vec<String>,
    /// Number of registered breakers
    pub total_breakers: usize,
}

/// Manager event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManagerEvent {
    /// A registered breaker opened
    BreakerOpened {
        /// Registered name
        name: String,
        /// Original breaker event
        event: BreakerEvent,
    },
    /// A registered breaker closed
    BreakerClosed {
        /// Registered name
        name: String,
        /// Original breaker event
        event: BreakerEvent,
    },
    /// A registered breaker published metrics
    BreakerMetrics {
        /// Registered name
        name: String,
        /// Published metrics
        metrics: BreakerMetrics,
    },
    /// Periodic health sweep result
    HealthCheck {
        /// Sweep result
        health: SystemHealth,
    },
    /// Periodic health sweep found open breakers
    SystemDegraded {
        /// Sweep result
        health: SystemHealth,
    },
}

impl ManagerEvent {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerEvent::BreakerOpened { .. } => "breaker-opened",
            ManagerEvent::BreakerClosed { .. } => "breaker-closed",
            ManagerEvent::BreakerMetrics { .. } => "breaker-metrics",
            ManagerEvent::HealthCheck { .. } => "health-check",
            ManagerEvent::SystemDegraded { .. } => "system-degraded",
        }
    }

    /// Registered breaker name, for breaker-scoped events
    pub fn breaker_name(&self) -> Option<&str> {
        match self {
            ManagerEvent::BreakerOpened { name, .. }
            | ManagerEvent::BreakerClosed { name, .. }
            | ManagerEvent::BreakerMetrics { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Re-publish a breaker event under `name`, if the manager forwards it
    pub(crate) fn forwarded(name: &str, event: BreakerEvent) -> Option<Self> {
        match &event.kind {
            BreakerEventKind::CircuitOpened { .. } => Some(ManagerEvent::BreakerOpened {
                name: name.to_string(),
                event,
            }),
            BreakerEventKind::CircuitClosed => Some(ManagerEvent::BreakerClosed {
                name: name.to_string(),
                event,
            }),
            BreakerEventKind::Metrics { metrics } => Some(ManagerEvent::BreakerMetrics {
                name: name.to_string(),
                metrics: metrics.clone(),
            }),
            _ => None,
        }
    }
}
