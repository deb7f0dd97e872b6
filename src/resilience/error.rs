//! Errors surfaced by [`CircuitBreaker::execute`]
//!
//! [`CircuitBreaker::execute`]: super::CircuitBreaker::execute

use std::time::Duration;
use thiserror::Error;

/// Error returned from a protected call
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The wrapped operation did not finish before the deadline
    #[error("operation timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Deadline that was exceeded
        timeout: Duration,
    },
    /// The circuit rejected the call without running the operation
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the rejecting breaker
        name: String,
    },
    /// The wrapped operation failed
    #[error(transparent)]
    Operation(anyhow::Error),
    /// The fallback failed while the circuit was open
    #[error("fallback for circuit breaker '{name}' failed: {source}")]
    Fallback {
        /// Name of the breaker whose fallback ran
        name: String,
        /// Error raised by the fallback
        #[source]
        source: anyhow::Error,
    },
}

impl BreakerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen { .. })
    }

    /// Original operation error, if this is one
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Convert into an `anyhow::Error`, unwrapping operation errors unchanged
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            BreakerError::Operation(e) => e,
            other => anyhow::Error::new(other),
        }
    }
}
