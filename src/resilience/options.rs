//! Breaker options
//!
//! [`BreakerOptions`] is the runtime configuration of one breaker, including
//! the error filter and fallback closures. [`BreakerSettings`] is its
//! serializable numeric part, used both for config files and for merging
//! overrides over defaults or presets.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether an error counts toward failure statistics
pub type ErrorFilter = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Substitute producer invoked while the circuit is open
pub type Fallback<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Circuit breaker options
pub struct BreakerOptions<T> {
    /// Counted failures required before opening
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing
    pub reset_timeout: Duration,
    /// Cadence of periodic metrics emission
    pub monitor_interval: Duration,
    /// Deadline applied to each wrapped call
    pub timeout: Duration,
    /// Minimum admitted calls before the circuit may open
    pub volume_threshold: u32,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_trials: u32,
    /// Only errors accepted by this filter are counted
    pub error_filter: Option<ErrorFilter>,
    /// Invoked instead of failing while the circuit is open
    pub fallback: Option<Fallback<T>>,
}

impl<T> Default for BreakerOptions<T> {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60000),
            monitor_interval: Duration::from_millis(10000),
            timeout: Duration::from_millis(30000),
            volume_threshold: 10,
            half_open_max_trials: 1,
            error_filter: None,
            fallback: None,
        }
    }
}

impl<T> Clone for BreakerOptions<T> {
    fn clone(&self) -> Self {
        Self {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            monitor_interval: self.monitor_interval,
            timeout: self.timeout,
            volume_threshold: self.volume_threshold,
            half_open_max_trials: self.half_open_max_trials,
            error_filter: self.error_filter.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BreakerOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerOptions")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("monitor_interval", &self.monitor_interval)
            .field("timeout", &self.timeout)
            .field("volume_threshold", &self.volume_threshold)
            .field("half_open_max_trials", &self.half_open_max_trials)
            .field("error_filter", &self.error_filter.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<T: Send + 'static> BreakerOptions<T> {
    /// Count only errors accepted by `filter`
    pub fn with_error_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.error_filter = Some(Arc::new(filter));
        self
    }

    /// Use an async fallback while the circuit is open
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move || fallback().boxed()));
        self
    }

    /// Return a fixed value while the circuit is open
    pub fn with_fallback_value(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.with_fallback(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Apply serializable overrides on top of these options
    pub fn with_settings(self, settings: &BreakerSettings) -> Self {
        settings.apply(self)
    }
}

/// Numeric breaker settings; unset fields keep the underlying value.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Counted failures required before opening
    pub failure_threshold: Option<u32>,
    /// Open duration before probing (milliseconds)
    pub reset_timeout_ms: Option<u64>,
    /// Metrics emission cadence (milliseconds)
    pub monitor_interval_ms: Option<u64>,
    /// Per-call deadline (milliseconds)
    pub timeout_ms: Option<u64>,
    /// Minimum admitted calls before the circuit may open
    pub volume_threshold: Option<u32>,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_trials: Option<u32>,
}

impl BreakerSettings {
    /// Merge these settings over `options`
    pub fn apply<T>(&self, mut options: BreakerOptions<T>) -> BreakerOptions<T> {
        if let Some(v) = self.failure_threshold {
            options.failure_threshold = v;
        }
        if let Some(ms) = self.reset_timeout_ms {
            options.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.monitor_interval_ms {
            options.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout_ms {
            options.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.volume_threshold {
            options.volume_threshold = v;
        }
        if let Some(v) = self.half_open_max_trials {
            options.half_open_max_trials = v;
        }
        options
    }

    /// Fully populated settings describing `options`
    pub fn from_options<T>(options: &BreakerOptions<T>) -> Self {
        Self {
            failure_threshold: Some(options.failure_threshold),
            reset_timeout_ms: Some(options.reset_timeout.as_millis() as u64),
            monitor_interval_ms: Some(options.monitor_interval.as_millis() as u64),
            timeout_ms: Some(options.timeout.as_millis() as u64),
            volume_threshold: Some(options.volume_threshold),
            half_open_max_trials: Some(options.half_open_max_trials),
        }
    }
}

/// Overrides merged over a factory preset
pub struct BreakerOverrides<T> {
    /// Numeric overrides
    pub settings: BreakerSettings,
    /// Replaces the preset error filter
    pub error_filter: Option<ErrorFilter>,
    /// Replaces the preset fallback
    pub fallback: Option<Fallback<T>>,
}

impl<T> Default for BreakerOverrides<T> {
    fn default() -> Self {
        Self {
            settings: BreakerSettings::default(),
            error_filter: None,
            fallback: None,
        }
    }
}

impl<T> From<BreakerSettings> for BreakerOverrides<T> {
    fn from(settings: BreakerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }
}

impl<T> BreakerOverrides<T> {
    /// Merge the overrides over `options`
    pub fn merge(self, options: BreakerOptions<T>) -> BreakerOptions<T> {
        let mut options = self.settings.apply(options);
        if let Some(filter) = self.error_filter {
            options.error_filter = Some(filter);
        }
        if let Some(fallback) = self.fallback {
            options.fallback = Some(fallback);
        }
        options
    }
}
