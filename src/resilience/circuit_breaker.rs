//! Circuit Breaker implementation
//!
//! A breaker protects one dependency. Calls pass through while the circuit
//! is closed; once enough of them fail the circuit opens and calls are
//! rejected (or served by the fallback) without touching the dependency.
//! After the reset timeout the breaker admits a bounded number of trial
//! calls: a successful trial closes the circuit, a failed one reopens it.
//!
//! ```text
//! Closed   --(failures >= threshold, requests >= volume)--> Open
//! Open     --(reset timeout elapses)------------------------> HalfOpen
//! HalfOpen --(trial succeeds)-------------------------------> Closed
//! HalfOpen --(trial fails)----------------------------------> Open
//! ```

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::BreakerError;
use super::events::{BreakerEvent, BreakerEventKind, BREAKER_EVENT_CAPACITY};
use super::options::BreakerOptions;
use super::state::{percentage, BreakerMetrics, BreakerState, CircuitStatus, ResponseTimeWindow};

/// Circuit breaker guarding a single dependency
///
/// Handles are cheap to clone and share one state. Dropping the last handle
/// cancels the breaker's timers.
///
/// # Example
/// ```no_run
/// use tripwire::resilience::{BreakerOptions, CircuitBreaker};
///
/// # async fn example() -> anyhow::Result<()> {
/// let breaker: CircuitBreaker<u32> = CircuitBreaker::new("inventory", BreakerOptions::default());
///
/// let value = breaker
///     .execute(|| async { Ok::<_, std::io::Error>(42) })
///     .await?;
/// assert_eq!(value, 42);
///
/// breaker.destroy();
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<T = serde_json::Value> {
    inner: Arc<BreakerInner<T>>,
}

impl<T> Clone for CircuitBreaker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for CircuitBreaker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("destroyed", &self.inner.is_destroyed())
            .finish()
    }
}

struct BreakerInner<T> {
    /// Name used in events and logs
    name: String,
    /// Options fixed at construction
    options: BreakerOptions<T>,
    /// Mutable state; never held across the wrapped operation
    core: Mutex<BreakerCore>,
    /// Event channel, taken on destroy
    events: std::sync::Mutex<Option<broadcast::Sender<BreakerEvent>>>,
    /// Timer tasks
    timers: std::sync::Mutex<BreakerTimers>,
    /// Set once by destroy
    destroyed: AtomicBool,
}

#[derive(Default)]
struct BreakerTimers {
    /// Pending open -> half-open transition
    reset: Option<JoinHandle<()>>,
    /// Periodic metrics emission
    monitor: Option<JoinHandle<()>>,
}

struct BreakerCore {
    state: BreakerState,
    window: ResponseTimeWindow,
    /// Monotonic time of the last counted failure
    last_failure_at: Option<Instant>,
    total_circuit_opens: u64,
    last_circuit_open: Option<DateTime<Utc>>,
    /// Trial permits for the current half-open episode
    trial_permits: Option<Arc<Semaphore>>,
    /// Bumped on every status change and reset; stale timers compare against it
    generation: u64,
    /// Bumped by reset; outcomes admitted under an older epoch are dropped
    epoch: u64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::default(),
            window: ResponseTimeWindow::new(),
            last_failure_at: None,
            total_circuit_opens: 0,
            last_circuit_open: None,
            trial_permits: None,
            generation: 0,
            epoch: 0,
        }
    }
}

/// Outcome of the admission check at the start of a call
enum Admission {
    /// Run the operation
    Admitted(Ticket),
    /// Serve from the fallback or fail fast
    Rejected,
}

/// What an admitted call knew about the breaker when it started
struct Ticket {
    /// Held by half-open trials until their outcome is recorded
    permit: Option<OwnedSemaphorePermit>,
    /// Generation the call was admitted under
    generation: u64,
    /// Reset epoch the call was admitted under
    epoch: u64,
}

impl Ticket {
    fn is_trial(&self) -> bool {
        self.permit.is_some()
    }
}

/// Why a call failed
enum FailureCause<'a> {
    Operation(&'a anyhow::Error),
    Timeout(Duration),
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> CircuitBreaker<T> {
    /// Create a new circuit breaker
    ///
    /// The metrics monitor starts immediately when called inside a Tokio
    /// runtime; outside one the breaker works but never emits metrics.
    pub fn new(name: impl Into<String>, options: BreakerOptions<T>) -> Self {
        let (tx, _) = broadcast::channel(BREAKER_EVENT_CAPACITY);

        let inner = Arc::new(BreakerInner {
            name: name.into(),
            options,
            core: Mutex::new(BreakerCore::new()),
            events: std::sync::Mutex::new(Some(tx)),
            timers: std::sync::Mutex::new(BreakerTimers::default()),
            destroyed: AtomicBool::new(false),
        });
        inner.start_monitor();

        debug!(
            "Created circuit breaker {} ({:?})",
            inner.name, inner.options
        );

        Self { inner }
    }

    /// Create a new circuit breaker with default options
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerOptions::default())
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// While open, the operation is never invoked: the fallback result is
    /// returned if one is configured, otherwise [`BreakerError::CircuitOpen`].
    /// Otherwise the operation races the configured timeout. Errors reach
    /// the caller whether or not the error filter counts them.
    ///
    /// On timeout the operation's future is dropped, which cancels it at its
    /// current await point. Work that must run to completion regardless
    /// should be spawned by the caller and awaited through its handle.
    ///
    /// Only a half-open trial admitted under the current state can close or
    /// reopen the circuit. Calls that started before a status change still
    /// update the counters; calls that started before [`reset`](Self::reset)
    /// are not recorded at all.
    pub async fn execute<F, Fut, E>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let ticket = match self.inner.admit().await {
            Admission::Admitted(ticket) => ticket,
            Admission::Rejected => return self.inner.reject().await,
        };

        let timeout = self.inner.options.timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, operation()).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(value)) => {
                self.inner.on_success(&ticket, elapsed).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                let error = e.into();
                self.inner
                    .on_failure(&ticket, FailureCause::Operation(&error), elapsed)
                    .await;
                Err(BreakerError::Operation(error))
            }
            Err(_) => {
                self.inner
                    .on_failure(&ticket, FailureCause::Timeout(timeout), elapsed)
                    .await;
                Err(BreakerError::Timeout { timeout })
            }
        };

        // Trial permits are held until the outcome is recorded
        drop(ticket);
        result
    }

    /// Get a copy of the current state record
    pub async fn state(&self) -> BreakerState {
        self.inner.core.lock().await.state.clone()
    }

    /// Get derived metrics
    pub async fn metrics(&self) -> BreakerMetrics {
        self.inner.metrics().await
    }

    /// Open the circuit regardless of statistics
    ///
    /// A forced open circuit stays open until [`force_close`] or [`reset`].
    ///
    /// [`force_close`]: Self::force_close
    /// [`reset`]: Self::reset
    pub async fn force_open(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock().await;
            self.inner
                .transition(&mut core, CircuitStatus::Open, &mut events);
            self.inner.cancel_reset_timer();
        }
        events.push(BreakerEventKind::CircuitForcedOpen);

        warn!("Circuit breaker {} forced open", self.inner.name);
        self.inner.emit_all(events);
    }

    /// Close the circuit regardless of statistics
    pub async fn force_close(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock().await;
            self.inner
                .transition(&mut core, CircuitStatus::Closed, &mut events);
            core.state.failure_count = 0;
            self.inner.cancel_reset_timer();
        }
        events.push(BreakerEventKind::CircuitForcedClosed);

        info!("Circuit breaker {} forced closed", self.inner.name);
        self.inner.emit_all(events);
    }

    /// Forget all history and return to the closed state
    ///
    /// Cancels a pending half-open transition; the metrics monitor keeps
    /// running.
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock().await;
            let from = core.state.status;
            let generation = core.generation + 1;
            let epoch = core.epoch + 1;

            *core = BreakerCore::new();
            core.generation = generation;
            core.epoch = epoch;
            self.inner.cancel_reset_timer();

            if from != CircuitStatus::Closed {
                events.push(BreakerEventKind::StateChange {
                    from,
                    to: CircuitStatus::Closed,
                });
            }
        }
        events.push(BreakerEventKind::CircuitReset);

        info!("Circuit breaker {} reset", self.inner.name);
        self.inner.emit_all(events);
    }

    /// Subscribe to this breaker's events
    ///
    /// After [`destroy`](Self::destroy) the returned receiver is already
    /// closed.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        match lock(&self.inner.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Cancel all timers and detach all subscribers
    ///
    /// Terminal and idempotent. Calls made afterwards still run but emit no
    /// events and schedule no timers.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.cancel_all_timers();
        lock(&self.inner.events).take();

        debug!("Circuit breaker {} destroyed", self.inner.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &BreakerOptions<T> {
        &self.inner.options
    }
}

impl<T> BreakerInner<T> {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> BreakerInner<T> {
    fn emit(&self, kind: BreakerEventKind) {
        if let Some(tx) = lock(&self.events).as_ref() {
            // No subscribers is not an error
            let _ = tx.send(BreakerEvent::new(&self.name, kind));
        }
    }

    fn emit_all(&self, events: Vec<BreakerEventKind>) {
        for kind in events {
            self.emit(kind);
        }
    }

    async fn admit(&self) -> Admission {
        let mut core = self.core.lock().await;

        match core.state.status {
            CircuitStatus::Closed => {
                core.state.total_requests += 1;
                Admission::Admitted(Ticket {
                    permit: None,
                    generation: core.generation,
                    epoch: core.epoch,
                })
            }
            CircuitStatus::HalfOpen => {
                let permit = core
                    .trial_permits
                    .clone()
                    .and_then(|permits| permits.try_acquire_owned().ok());

                match permit {
                    Some(permit) => {
                        core.state.total_requests += 1;
                        debug!("Circuit breaker {} admitted trial call", self.name);
                        Admission::Admitted(Ticket {
                            permit: Some(permit),
                            generation: core.generation,
                            epoch: core.epoch,
                        })
                    }
                    None => Admission::Rejected,
                }
            }
            CircuitStatus::Open => Admission::Rejected,
        }
    }

    async fn reject(&self) -> Result<T, BreakerError> {
        self.emit(BreakerEventKind::CircuitOpen);

        let Some(fallback) = self.options.fallback.clone() else {
            warn!("Circuit breaker {} rejected call (circuit open)", self.name);
            return Err(BreakerError::CircuitOpen {
                name: self.name.clone(),
            });
        };

        match fallback().await {
            Ok(value) => {
                debug!("Circuit breaker {} served call from fallback", self.name);
                self.emit(BreakerEventKind::FallbackExecuted);
                Ok(value)
            }
            Err(e) => {
                warn!("Circuit breaker {} fallback failed: {}", self.name, e);
                self.emit(BreakerEventKind::FallbackFailed {
                    error: e.to_string(),
                });
                Err(BreakerError::Fallback {
                    name: self.name.clone(),
                    source: e,
                })
            }
        }
    }

    async fn on_success(self: &Arc<Self>, ticket: &Ticket, elapsed: Duration) {
        let mut events = vec![BreakerEventKind::Success { elapsed }];
        {
            let mut core = self.core.lock().await;
            if core.epoch != ticket.epoch {
                debug!(
                    "Circuit breaker {} dropped success of a call admitted before reset",
                    self.name
                );
                drop(core);
                self.emit_all(events);
                return;
            }

            let state = &mut core.state;
            state.failure_count = 0;
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.total_successes += 1;
            state.last_success_time = Some(Utc::now());

            core.window.record(elapsed);
            core.state.average_response_time_ms = core.window.average();

            if Self::owns_trial(&core, ticket) {
                self.transition(&mut core, CircuitStatus::Closed, &mut events);
                events.push(BreakerEventKind::CircuitClosed);
            }
        }

        debug!(
            "Circuit breaker {} call succeeded in {}ms",
            self.name,
            elapsed.as_millis()
        );
        self.emit_all(events);
    }

    async fn on_failure(
        self: &Arc<Self>,
        ticket: &Ticket,
        cause: FailureCause<'_>,
        elapsed: Duration,
    ) {
        let (accepted, message) = match cause {
            FailureCause::Timeout(timeout) => {
                warn!(
                    "Circuit breaker {} call timed out after {}ms",
                    self.name,
                    timeout.as_millis()
                );
                (true, BreakerError::Timeout { timeout }.to_string())
            }
            FailureCause::Operation(error) => {
                let accepted = self
                    .options
                    .error_filter
                    .as_ref()
                    .map_or(true, |filter| filter(error));
                (accepted, error.to_string())
            }
        };

        if !accepted {
            debug!("Circuit breaker {} ignored filtered error", self.name);
            self.emit(BreakerEventKind::Failure {
                error: message,
                elapsed,
                counted: false,
            });
            return;
        }

        let mut core = self.core.lock().await;
        if core.epoch != ticket.epoch {
            drop(core);
            debug!(
                "Circuit breaker {} dropped failure of a call admitted before reset",
                self.name
            );
            self.emit(BreakerEventKind::Failure {
                error: message,
                elapsed,
                counted: false,
            });
            return;
        }

        let mut events = vec![BreakerEventKind::Failure {
            error: message,
            elapsed,
            counted: true,
        }];

        let state = &mut core.state;
        state.failure_count += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.total_failures += 1;
        state.last_failure_time = Some(Utc::now());

        core.last_failure_at = Some(Instant::now());
        core.window.record(elapsed);
        core.state.average_response_time_ms = core.window.average();

        match core.state.status {
            CircuitStatus::Closed => {
                let volume_reached =
                    core.state.total_requests >= u64::from(self.options.volume_threshold);
                let threshold_reached = core.state.failure_count >= self.options.failure_threshold;

                if volume_reached && threshold_reached {
                    self.open(&mut core, &mut events);
                }
            }
            // A failed trial reopens immediately
            CircuitStatus::HalfOpen if Self::owns_trial(&core, ticket) => {
                self.open(&mut core, &mut events);
            }
            // Late calls from an earlier state only update the counters
            CircuitStatus::HalfOpen | CircuitStatus::Open => {}
        }
        drop(core);

        self.emit_all(events);
    }

    /// Whether `ticket` is a trial of the current half-open episode
    fn owns_trial(core: &BreakerCore, ticket: &Ticket) -> bool {
        ticket.is_trial()
            && core.state.status == CircuitStatus::HalfOpen
            && core.generation == ticket.generation
    }

    /// Move to open and schedule the half-open transition
    fn open(self: &Arc<Self>, core: &mut BreakerCore, events: &mut Vec<BreakerEventKind>) {
        let failure_count = core.state.failure_count;
        self.transition(core, CircuitStatus::Open, events);
        events.push(BreakerEventKind::CircuitOpened { failure_count });

        warn!(
            "Circuit breaker {} opened after {} failures ({} requests)",
            self.name, failure_count, core.state.total_requests
        );

        self.schedule_half_open(core.generation);
    }

    /// Apply a status change; callers push the specific event
    fn transition(
        &self,
        core: &mut BreakerCore,
        to: CircuitStatus,
        events: &mut Vec<BreakerEventKind>,
    ) {
        let from = core.state.status;
        if from == to {
            return;
        }

        core.state.status = to;
        core.generation += 1;

        match to {
            CircuitStatus::Open => {
                core.total_circuit_opens += 1;
                core.last_circuit_open = Some(Utc::now());
                core.trial_permits = None;
            }
            CircuitStatus::HalfOpen => {
                let trials = self.options.half_open_max_trials.max(1) as usize;
                core.trial_permits = Some(Arc::new(Semaphore::new(trials)));
                core.state.consecutive_successes = 0;
            }
            CircuitStatus::Closed => {
                core.state.failure_count = 0;
                core.trial_permits = None;
            }
        }

        events.push(BreakerEventKind::StateChange { from, to });

        info!(
            "Circuit breaker {} transitioned from {} to {}",
            self.name, from, to
        );
    }

    fn schedule_half_open(self: &Arc<Self>, generation: u64) {
        if self.is_destroyed() {
            return;
        }

        let deadline = Instant::now() + self.options.reset_timeout;
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.half_open(generation).await;
            }
        });

        if let Some(previous) = lock(&self.timers).reset.replace(task) {
            previous.abort();
        }
    }

    async fn half_open(&self, generation: u64) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock().await;
            // A reset, forced change or newer open superseded this timer
            if self.is_destroyed()
                || core.generation != generation
                || core.state.status != CircuitStatus::Open
            {
                return;
            }

            self.transition(&mut core, CircuitStatus::HalfOpen, &mut events);
            events.push(BreakerEventKind::CircuitHalfOpened);
        }

        self.emit_all(events);
    }

    async fn metrics(&self) -> BreakerMetrics {
        let core = self.core.lock().await;
        let state = &core.state;

        let circuit_open_time = match (state.status, core.last_failure_at) {
            (CircuitStatus::Open, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        };

        BreakerMetrics {
            status: state.status,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            success_rate: percentage(state.total_successes, state.total_requests),
            failure_rate: percentage(state.total_failures, state.total_requests),
            average_response_time_ms: state.average_response_time_ms,
            circuit_open_time,
            total_circuit_opens: core.total_circuit_opens,
            last_circuit_open: core.last_circuit_open,
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Circuit breaker {} created outside a Tokio runtime; metrics monitor disabled",
                self.name
            );
            return;
        };

        let period = self.options.monitor_interval.max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                // Hold the breaker only for the duration of one tick
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_destroyed() {
                    break;
                }

                let metrics = inner.metrics().await;
                inner.emit(BreakerEventKind::Metrics { metrics });
            }
        });

        lock(&self.timers).monitor = Some(task);
    }

    fn cancel_reset_timer(&self) {
        if let Some(task) = lock(&self.timers).reset.take() {
            task.abort();
        }
    }

    fn cancel_all_timers(&self) {
        let mut timers = lock(&self.timers);
        if let Some(task) = timers.reset.take() {
            task.abort();
        }
        if let Some(task) = timers.monitor.take() {
            task.abort();
        }
    }
}

impl<T> Drop for BreakerInner<T> {
    fn drop(&mut self) {
        let timers = self
            .timers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = timers.reset.take() {
            task.abort();
        }
        if let Some(task) = timers.monitor.take() {
            task.abort();
        }
    }
}
