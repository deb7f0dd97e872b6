//! Resilience module for Tripwire
//!
//! This module provides the circuit breaker and its companions:
//! - Circuit breaker with timeout, error filtering and fallback
//! - Preset breakers for HTTP, database and external API dependencies
//! - A manager aggregating the health of named breakers
//! - Chaos testing tools

mod circuit_breaker;
mod error;
mod events;
mod factory;
mod manager;
mod options;
mod state;
mod testing;

pub use circuit_breaker::CircuitBreaker;

pub use error::BreakerError;

pub use events::{
    BreakerEvent,
    BreakerEventKind,
    ManagerEvent,
    SystemHealth,
    BREAKER_EVENT_CAPACITY,
    MANAGER_EVENT_CAPACITY,
};

pub use factory::{
    is_connection_failure,
    is_database_failure,
    is_external_api_failure,
    is_http_failure,
    CircuitBreakerFactory,
    DatabaseErrorKind,
    DependencyError,
    Preset,
    Unavailable,
    UnavailableKind,
};

pub use manager::{CircuitBreakerManager, ManagedBreaker, DEFAULT_HEALTH_CHECK_INTERVAL};

pub use options::{BreakerOptions, BreakerOverrides, BreakerSettings, ErrorFilter, Fallback};

pub use state::{BreakerMetrics, BreakerState, CircuitStatus, ResponseTimeWindow, RESPONSE_TIME_WINDOW};

pub use testing::{ChaosTestResult, ChaosTestingConfig, CircuitBreakerTester};
