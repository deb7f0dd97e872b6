//! Property-based tests for the circuit breaker using proptest
//!
//! Each case runs on its own current-thread runtime with a paused clock, so
//! reset timeouts elapse instantly and deterministically.

use anyhow::anyhow;
use proptest::prelude::*;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tripwire::resilience::{BreakerOptions, CircuitBreaker, CircuitBreakerManager, CircuitStatus};

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("failed to build runtime")
        .block_on(future)
}

fn options(failure_threshold: u32, volume_threshold: u32) -> BreakerOptions<u32> {
    BreakerOptions {
        failure_threshold,
        volume_threshold,
        reset_timeout: Duration::from_millis(1000),
        monitor_interval: Duration::from_secs(3600),
        ..BreakerOptions::default()
    }
}

async fn call(breaker: &CircuitBreaker<u32>, succeed: bool) {
    let _ = breaker
        .execute(|| async move {
            if succeed {
                Ok(1)
            } else {
                Err(anyhow!("dependency down"))
            }
        })
        .await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn opens_after_enough_consecutive_failures(f in 1u32..20, v in 1u32..20) {
        let status = block_on(async move {
            let breaker = CircuitBreaker::new("prop", options(f, v));
            for _ in 0..f.max(v) {
                call(&breaker, false).await;
            }
            let status = breaker.state().await.status;
            breaker.destroy();
            status
        });
        prop_assert_eq!(status, CircuitStatus::Open);
    }

    #[test]
    fn open_circuit_never_invokes_operation(calls in 1usize..30, wait_ms in 0u64..999) {
        let invoked = block_on(async move {
            let breaker = CircuitBreaker::new("prop", options(1, 1));
            call(&breaker, false).await;

            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..calls {
                let counter = Arc::clone(&counter);
                let _ = breaker
                    .execute(|| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(1)
                    })
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            let _ = breaker.execute(|| async { Ok::<_, anyhow::Error>(1) }).await;

            breaker.destroy();
            counter.load(Ordering::SeqCst)
        });
        prop_assert_eq!(invoked, 0);
    }

    #[test]
    fn successful_trial_closes(f in 1u32..10) {
        let state = block_on(async move {
            let breaker = CircuitBreaker::new("prop", options(f, 1));
            for _ in 0..f {
                call(&breaker, false).await;
            }
            tokio::time::sleep(Duration::from_millis(1001)).await;
            call(&breaker, true).await;

            let state = breaker.state().await;
            breaker.destroy();
            state
        });
        prop_assert_eq!(state.status, CircuitStatus::Closed);
        prop_assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn reset_always_yields_clean_closed_state(
        outcomes in prop::collection::vec(any::<bool>(), 0..40),
        forced in any::<bool>(),
    ) {
        let (state, metrics) = block_on(async move {
            let breaker = CircuitBreaker::new("prop", options(3, 3));
            for succeed in outcomes {
                call(&breaker, succeed).await;
            }
            if forced {
                breaker.force_open().await;
            }
            breaker.reset().await;

            let state = breaker.state().await;
            let metrics = breaker.metrics().await;
            breaker.destroy();
            (state, metrics)
        });
        prop_assert_eq!(state.status, CircuitStatus::Closed);
        prop_assert_eq!(state.failure_count, 0);
        prop_assert_eq!(state.consecutive_failures, 0);
        prop_assert_eq!(state.consecutive_successes, 0);
        prop_assert_eq!(state.total_requests, 0);
        prop_assert_eq!(state.total_failures, 0);
        prop_assert_eq!(state.total_successes, 0);
        prop_assert_eq!(metrics.total_circuit_opens, 0);
    }

    #[test]
    fn rejected_errors_never_open(calls in 1usize..60, f in 1u32..5) {
        let status = block_on(async move {
            let breaker = CircuitBreaker::new("prop", options(f, 1).with_error_filter(|_| false));
            for _ in 0..calls {
                call(&breaker, false).await;
            }
            let status = breaker.state().await.status;
            breaker.destroy();
            status
        });
        prop_assert_eq!(status, CircuitStatus::Closed);
    }

    #[test]
    fn success_and_failure_rates_sum_to_hundred(
        outcomes in prop::collection::vec(any::<bool>(), 1..60),
    ) {
        let metrics = block_on(async move {
            // Never opens, so every call is a counted success or failure
            let breaker = CircuitBreaker::new("prop", options(1000, 1));
            for succeed in outcomes {
                call(&breaker, succeed).await;
            }
            let metrics = breaker.metrics().await;
            breaker.destroy();
            metrics
        });
        prop_assert!((metrics.success_rate + metrics.failure_rate - 100.0).abs() < 1e-6);
    }

    #[test]
    fn unhealthy_iff_some_breaker_open(open in prop::collection::vec(any::<bool>(), 0..8)) {
        let (healthy, open_count, expected_open) = block_on(async move {
            let manager = CircuitBreakerManager::with_health_check_interval(Duration::from_secs(3600));
            for (i, force) in open.iter().enumerate() {
                let breaker = CircuitBreaker::new(format!("breaker-{}", i), options(5, 5));
                if *force {
                    breaker.force_open().await;
                }
                manager.register(format!("breaker-{}", i), breaker).await;
            }

            let health = manager.system_health().await;
            manager.destroy().await;
            (
                health.healthy,
                health.open_breakers.len(),
                open.iter().filter(|force| **force).count(),
            )
        });
        prop_assert_eq!(open_count, expected_open);
        prop_assert_eq!(healthy, expected_open == 0);
    }

    #[test]
    fn destroy_is_idempotent(times in 1usize..5) {
        let quiet = block_on(async move {
            let breaker = CircuitBreaker::new(
                "prop",
                BreakerOptions {
                    monitor_interval: Duration::from_millis(10),
                    ..options(1, 1)
                },
            );
            call(&breaker, false).await;
            let mut events = breaker.subscribe();

            for _ in 0..times {
                breaker.destroy();
            }
            tokio::time::sleep(Duration::from_millis(2000)).await;

            // No metrics ticks or half-open transitions after destruction
            matches!(events.try_recv(), Err(TryRecvError::Closed))
                && breaker.state().await.status == CircuitStatus::Open
        });
        prop_assert!(quiet);
    }
}
