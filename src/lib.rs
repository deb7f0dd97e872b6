pub mod config;
pub mod logging;
pub mod resilience;

pub use config::{BreakerConfig, ManagerConfig};
pub use resilience::{
    BreakerError, BreakerOptions, CircuitBreaker, CircuitBreakerFactory, CircuitBreakerManager,
    CircuitStatus,
};
