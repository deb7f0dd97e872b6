//! Preset circuit breakers for common dependency classes
//!
//! Each preset pairs thresholds suited to the dependency with an error
//! filter that counts only infrastructure failures (a 404 from an HTTP API
//! or a constraint violation from a database says nothing about the health
//! of the dependency) and a fallback returning an [`Unavailable`] payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::circuit_breaker::CircuitBreaker;
use super::options::{BreakerOptions, BreakerOverrides};

/// Errors raised by dependency clients, classified by the preset filters
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// The dependency answered with an HTTP error status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Response reason or body excerpt
        message: String,
    },
    /// Name resolution failed
    #[error("host not found: {host}")]
    HostNotFound {
        /// Host that failed to resolve
        host: String,
    },
    /// The database rejected or failed the request
    #[error("database error ({kind}): {message}")]
    Database {
        /// Error class
        kind: DatabaseErrorKind,
        /// Driver message
        message: String,
    },
}

/// Database error classes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseErrorKind {
    /// Could not reach the server
    Connection,
    /// Credentials rejected
    AccessDenied,
    /// Database or schema does not exist
    UnknownDatabase,
    /// Statement failed
    Query,
    /// Constraint or uniqueness violation
    Constraint,
}

impl std::fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseErrorKind::Connection => write!(f, "connection"),
            DatabaseErrorKind::AccessDenied => write!(f, "access denied"),
            DatabaseErrorKind::UnknownDatabase => write!(f, "unknown database"),
            DatabaseErrorKind::Query => write!(f, "query"),
            DatabaseErrorKind::Constraint => write!(f, "constraint"),
        }
    }
}

/// Which dependency class a fallback payload stands in for
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableKind {
    Service,
    Database,
    ExternalService,
}

/// Fallback payload returned by the presets while the circuit is open
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unavailable {
    /// Dependency class
    pub kind: UnavailableKind,
    /// Human readable message
    pub message: String,
    /// Always true; marks the value as a substitute
    pub fallback: bool,
    /// When the fallback was produced
    pub timestamp: DateTime<Utc>,
}

impl Unavailable {
    pub fn new(kind: UnavailableKind) -> Self {
        let message = match kind {
            UnavailableKind::Service => "Service temporarily unavailable",
            UnavailableKind::Database => "Database temporarily unavailable",
            UnavailableKind::ExternalService => "External service temporarily unavailable",
        };

        Self {
            kind,
            message: message.to_string(),
            fallback: true,
            timestamp: Utc::now(),
        }
    }
}

impl From<Unavailable> for serde_json::Value {
    fn from(payload: Unavailable) -> Self {
        serde_json::json!({
            "kind": payload.kind,
            "error": payload.message,
            "fallback": payload.fallback,
            "timestamp": payload.timestamp.to_rfc3339(),
        })
    }
}

/// Breaker preset
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// HTTP calls to internal services
    Http,
    /// Database calls
    Database,
    /// Third-party APIs, including rate limiting
    ExternalApi,
    /// Library defaults, no filter and no fallback
    #[default]
    Custom,
}

/// First error of type `E` in the error chain
fn find_in_chain<E>(error: &anyhow::Error) -> Option<&E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    error.chain().find_map(|cause| cause.downcast_ref::<E>())
}

fn http_status(error: &anyhow::Error) -> Option<u16> {
    match find_in_chain::<DependencyError>(error) {
        Some(DependencyError::Http { status, .. }) => Some(*status),
        _ => None,
    }
}

/// Connection refused, name resolution failure or network timeout
pub fn is_connection_failure(error: &anyhow::Error) -> bool {
    use std::io::ErrorKind;

    if let Some(io) = find_in_chain::<std::io::Error>(error) {
        if matches!(io.kind(), ErrorKind::ConnectionRefused | ErrorKind::TimedOut) {
            return true;
        }
    }

    matches!(
        find_in_chain::<DependencyError>(error),
        Some(DependencyError::HostNotFound { .. })
    )
}

/// Errors counted by the HTTP preset
pub fn is_http_failure(error: &anyhow::Error) -> bool {
    is_connection_failure(error) || http_status(error).is_some_and(|status| status >= 500)
}

/// Errors counted by the database preset
pub fn is_database_failure(error: &anyhow::Error) -> bool {
    if let Some(io) = find_in_chain::<std::io::Error>(error) {
        if io.kind() == std::io::ErrorKind::ConnectionRefused {
            return true;
        }
    }

    matches!(
        find_in_chain::<DependencyError>(error),
        Some(DependencyError::Database {
            kind: DatabaseErrorKind::Connection
                | DatabaseErrorKind::AccessDenied
                | DatabaseErrorKind::UnknownDatabase,
            ..
        })
    )
}

/// Errors counted by the external API preset
pub fn is_external_api_failure(error: &anyhow::Error) -> bool {
    is_http_failure(error) || http_status(error) == Some(429)
}

/// Builds preconfigured circuit breakers
pub struct CircuitBreakerFactory;

impl CircuitBreakerFactory {
    /// Options of the HTTP preset
    pub fn http_options<T>() -> BreakerOptions<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        BreakerOptions {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            volume_threshold: 10,
            ..BreakerOptions::default()
        }
        .with_error_filter(is_http_failure)
        .with_fallback(|| async { Ok(T::from(Unavailable::new(UnavailableKind::Service))) })
    }

    /// Options of the database preset
    pub fn database_options<T>() -> BreakerOptions<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        BreakerOptions {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            timeout: Duration::from_secs(15),
            volume_threshold: 5,
            ..BreakerOptions::default()
        }
        .with_error_filter(is_database_failure)
        .with_fallback(|| async { Ok(T::from(Unavailable::new(UnavailableKind::Database))) })
    }

    /// Options of the external API preset
    pub fn external_api_options<T>() -> BreakerOptions<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        BreakerOptions {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(120),
            timeout: Duration::from_secs(20),
            volume_threshold: 20,
            ..BreakerOptions::default()
        }
        .with_error_filter(is_external_api_failure)
        .with_fallback(|| async {
            Ok(T::from(Unavailable::new(UnavailableKind::ExternalService)))
        })
    }

    /// Options of any preset
    pub fn preset_options<T>(preset: Preset) -> BreakerOptions<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        match preset {
            Preset::Http => Self::http_options(),
            Preset::Database => Self::database_options(),
            Preset::ExternalApi => Self::external_api_options(),
            Preset::Custom => BreakerOptions::default(),
        }
    }

    /// Create a breaker for HTTP calls
    pub fn create_http_breaker<T>(
        name: impl Into<String>,
        overrides: BreakerOverrides<T>,
    ) -> CircuitBreaker<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        Self::create(Preset::Http, name, overrides)
    }

    /// Create a breaker for database calls
    pub fn create_database_breaker<T>(
        name: impl Into<String>,
        overrides: BreakerOverrides<T>,
    ) -> CircuitBreaker<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        Self::create(Preset::Database, name, overrides)
    }

    /// Create a breaker for third-party API calls
    pub fn create_external_api_breaker<T>(
        name: impl Into<String>,
        overrides: BreakerOverrides<T>,
    ) -> CircuitBreaker<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        Self::create(Preset::ExternalApi, name, overrides)
    }

    /// Create a breaker from a preset with overrides merged over it
    pub fn create<T>(
        preset: Preset,
        name: impl Into<String>,
        overrides: BreakerOverrides<T>,
    ) -> CircuitBreaker<T>
    where
        T: From<Unavailable> + Send + 'static,
    {
        let options = overrides.merge(Self::preset_options(preset));
        CircuitBreaker::new(name, options)
    }
}
