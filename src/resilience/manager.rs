//! Registry of named circuit breakers
//!
//! The manager re-publishes the open/closed/metrics events of every
//! registered breaker tagged with its registered name, and periodically
//! sweeps all breakers into a [`SystemHealth`] snapshot.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreaker;
use super::events::{BreakerEvent, ManagerEvent, SystemHealth, MANAGER_EVENT_CAPACITY};
use super::state::{BreakerMetrics, BreakerState, CircuitStatus};

/// Default cadence of the health sweep
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Type-erased view of a circuit breaker, whatever its output type
#[async_trait]
pub trait ManagedBreaker: Send + Sync {
    /// Breaker name
    fn name(&self) -> &str;

    /// Copy of the state record
    async fn state(&self) -> BreakerState;

    /// Derived metrics
    async fn metrics(&self) -> BreakerMetrics;

    /// Open the circuit manually
    async fn force_open(&self);

    /// Close the circuit manually
    async fn force_close(&self);

    /// Forget history and close the circuit
    async fn reset(&self);

    /// Subscribe to the breaker's events
    fn subscribe(&self) -> broadcast::Receiver<BreakerEvent>;

    /// Cancel timers and detach subscribers
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;

    /// Access to the concrete breaker for typed lookups
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<T: Send + 'static> ManagedBreaker for CircuitBreaker<T> {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    async fn state(&self) -> BreakerState {
        CircuitBreaker::state(self).await
    }

    async fn metrics(&self) -> BreakerMetrics {
        CircuitBreaker::metrics(self).await
    }

    async fn force_open(&self) {
        CircuitBreaker::force_open(self).await
    }

    async fn force_close(&self) {
        CircuitBreaker::force_close(self).await
    }

    async fn reset(&self) {
        CircuitBreaker::reset(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        CircuitBreaker::subscribe(self)
    }

    fn destroy(&self) {
        CircuitBreaker::destroy(self)
    }

    fn is_destroyed(&self) -> bool {
        CircuitBreaker::is_destroyed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Circuit breaker manager
#[derive(Clone)]
pub struct CircuitBreakerManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    /// Registered breakers by name
    breakers: RwLock<HashMap<String, RegisteredBreaker>>,
    /// Event channel, taken on destroy
    events: std::sync::Mutex<Option<broadcast::Sender<ManagerEvent>>>,
    /// Periodic health sweep
    sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
    health_check_interval: Duration,
    destroyed: AtomicBool,
}

struct RegisteredBreaker {
    breaker: Arc<dyn ManagedBreaker>,
    /// Task re-publishing the breaker's events
    forwarder: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreakerManager {
    /// Create a new manager sweeping every 30 seconds
    pub fn new() -> Self {
        Self::with_health_check_interval(DEFAULT_HEALTH_CHECK_INTERVAL)
    }

    /// Create a new manager with a custom sweep interval
    pub fn with_health_check_interval(interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(MANAGER_EVENT_CAPACITY);

        let inner = Arc::new(ManagerInner {
            breakers: RwLock::new(HashMap::new()),
            events: std::sync::Mutex::new(Some(tx)),
            sweep: std::sync::Mutex::new(None),
            health_check_interval: interval,
            destroyed: AtomicBool::new(false),
        });
        inner.start_sweep();

        Self { inner }
    }

    /// Register a breaker under `name`
    ///
    /// An existing registration with the same name is replaced; the replaced
    /// breaker is left running. Ignored once the manager is destroyed.
    pub async fn register<B>(&self, name: impl Into<String>, breaker: B)
    where
        B: ManagedBreaker + 'static,
    {
        let name = name.into();
        let breaker: Arc<dyn ManagedBreaker> = Arc::new(breaker);

        // destroy() sets the flag before draining under the write lock
        let mut breakers = self.inner.breakers.write().await;
        if self.is_destroyed() {
            warn!(
                "Circuit breaker manager destroyed; ignoring registration of {}",
                name
            );
            return;
        }

        let forwarder = self.inner.spawn_forwarder(&name, breaker.subscribe());
        let previous = breakers.insert(
            name.clone(),
            RegisteredBreaker {
                breaker,
                forwarder,
            },
        );
        drop(breakers);

        match previous {
            Some(previous) => {
                if let Some(task) = previous.forwarder {
                    task.abort();
                }
                warn!("Replaced circuit breaker registered as {}", name);
            }
            None => info!("Registered circuit breaker {}", name),
        }
    }

    /// Look up a breaker by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ManagedBreaker>> {
        self.inner
            .breakers
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.breaker))
    }

    /// Look up a breaker by name and output type
    pub async fn get_typed<T: Send + 'static>(&self, name: &str) -> Option<CircuitBreaker<T>> {
        let breaker = self.get(name).await?;
        breaker.as_any().downcast_ref::<CircuitBreaker<T>>().cloned()
    }

    /// All registered breakers
    pub async fn get_all(&self) -> HashMap<String, Arc<dyn ManagedBreaker>> {
        self.inner
            .breakers
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.breaker)))
            .collect()
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.inner.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.breakers.read().await.is_empty()
    }

    /// Aggregate health; healthy iff no breaker is open
    pub async fn system_health(&self) -> SystemHealth {
        self.inner.system_health().await
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        match lock(&self.inner.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Destroy every registered breaker and stop the manager
    ///
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<(String, RegisteredBreaker)> =
            self.inner.breakers.write().await.drain().collect();

        for (name, entry) in drained {
            if let Some(task) = entry.forwarder {
                task.abort();
            }
            entry.breaker.destroy();
            debug!("Destroyed circuit breaker {}", name);
        }

        if let Some(task) = lock(&self.inner.sweep).take() {
            task.abort();
        }
        lock(&self.inner.events).take();

        info!("Circuit breaker manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    fn emit(&self, event: ManagerEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn system_health(&self) -> SystemHealth {
        // Snapshot the registry so no lock is held while querying breakers
        let breakers: Vec<(String, Arc<dyn ManagedBreaker>)> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.breaker)))
            .collect();

        let mut open_breakers = Vec::new();
        for (name, breaker) in &breakers {
            if breaker.state().await.status == CircuitStatus::Open {
                open_breakers.push(name.clone());
            }
        }
        open_breakers.sort();

        SystemHealth {
            healthy: open_breakers.is_empty(),
            open_breakers,
            total_breakers: breakers.len(),
        }
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        name: &str,
        mut events: broadcast::Receiver<BreakerEvent>,
    ) -> Option<JoinHandle<()>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return None;
        }

        let name = name.to_string();
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Some(forwarded) = ManagerEvent::forwarded(&name, event) {
                            inner.emit(forwarded);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Circuit breaker manager skipped {} events from {}",
                            skipped, name
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    fn start_sweep(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Circuit breaker manager created outside a Tokio runtime; health sweep disabled");
            return;
        };

        let period = self.health_check_interval.max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.destroyed.load(Ordering::SeqCst) {
                    break;
                }

                let health = inner.system_health().await;
                if !health.healthy {
                    warn!(
                        "System degraded: {} of {} circuit breakers open ({})",
                        health.open_breakers.len(),
                        health.total_breakers,
                        health.open_breakers.join(", ")
                    );
                }

                inner.emit(ManagerEvent::HealthCheck {
                    health: health.clone(),
                });
                if !health.healthy {
                    inner.emit(ManagerEvent::SystemDegraded { health });
                }
            }
        });

        *lock(&self.sweep) = Some(task);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let sweep = self.sweep.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = sweep.take() {
            task.abort();
        }
        for entry in self.breakers.get_mut().values_mut() {
            if let Some(task) = entry.forwarder.take() {
                task.abort();
            }
        }
    }
}
