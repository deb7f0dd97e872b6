use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tripwire::resilience::{
    BreakerEventKind, BreakerOptions, CircuitBreaker, CircuitBreakerManager, CircuitStatus,
    ManagerEvent,
};

fn quiet_manager() -> CircuitBreakerManager {
    CircuitBreakerManager::with_health_check_interval(Duration::from_secs(3600))
}

fn breaker(name: &str, failure_threshold: u32) -> CircuitBreaker<u32> {
    CircuitBreaker::new(
        name,
        BreakerOptions {
            failure_threshold,
            volume_threshold: 1,
            reset_timeout: Duration::from_millis(1000),
            monitor_interval: Duration::from_secs(3600),
            ..BreakerOptions::default()
        },
    )
}

async fn next_event(events: &mut broadcast::Receiver<ManagerEvent>) -> Result<ManagerEvent> {
    Ok(tokio::time::timeout(Duration::from_secs(5), events.recv()).await??)
}

async fn fail(breaker: &CircuitBreaker<u32>) {
    let result = breaker
        .execute(|| async { Err::<u32, _>(anyhow!("connection reset")) })
        .await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_register_and_lookup() -> Result<()> {
    let manager = quiet_manager();
    assert!(manager.is_empty().await);

    manager.register("users", breaker("users", 5)).await;
    manager.register("accounts", breaker("accounts", 5)).await;

    assert_eq!(manager.len().await, 2);
    assert_eq!(manager.names().await, vec!["accounts", "users"]);
    assert!(manager.get("missing").await.is_none());

    let users = manager.get("users").await.expect("users registered");
    assert_eq!(users.name(), "users");
    assert_eq!(manager.get_all().await.len(), 2);

    // Typed lookups only succeed for the registered output type
    let typed = manager.get_typed::<u32>("users").await.expect("typed lookup");
    assert_eq!(typed.execute(|| async { Ok::<_, anyhow::Error>(3) }).await?, 3);
    assert!(manager.get_typed::<String>("users").await.is_none());

    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_opened_and_closed_events_are_forwarded() -> Result<()> {
    let manager = quiet_manager();
    let mut events = manager.subscribe();

    let payments = breaker("payments-v2", 1);
    manager.register("payments", payments.clone()).await;

    fail(&payments).await;

    match next_event(&mut events).await? {
        ManagerEvent::BreakerOpened { name, event } => {
            assert_eq!(name, "payments");
            assert_eq!(event.breaker, "payments-v2");
            assert_eq!(event.kind, BreakerEventKind::CircuitOpened { failure_count: 1 });
        }
        other => panic!("unexpected event: {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(1001)).await;
    payments
        .execute(|| async { Ok::<_, anyhow::Error>(1) })
        .await?;

    let closed = next_event(&mut events).await?;
    assert_eq!(closed.as_str(), "breaker-closed");
    assert_eq!(closed.breaker_name(), Some("payments"));

    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_metrics_are_forwarded() -> Result<()> {
    let manager = quiet_manager();
    let mut events = manager.subscribe();

    let search = CircuitBreaker::<u32>::new(
        "search",
        BreakerOptions {
            monitor_interval: Duration::from_millis(100),
            ..BreakerOptions::default()
        },
    );
    manager.register("search", search).await;

    match next_event(&mut events).await? {
        ManagerEvent::BreakerMetrics { name, metrics } => {
            assert_eq!(name, "search");
            assert_eq!(metrics.status, CircuitStatus::Closed);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_system_health_reflects_open_breakers() -> Result<()> {
    let manager = quiet_manager();
    let inventory = breaker("inventory", 5);
    let shipping = breaker("shipping", 5);
    manager.register("inventory", inventory.clone()).await;
    manager.register("shipping", shipping.clone()).await;

    let health = manager.system_health().await;
    assert!(health.healthy);
    assert!(health.open_breakers.is_empty());
    assert_eq!(health.total_breakers, 2);

    shipping.force_open().await;

    let health = manager.system_health().await;
    assert!(!health.healthy);
    assert_eq!(health.open_breakers, vec!["shipping"]);

    // Half-open is not open
    let search = breaker("search", 1);
    manager.register("search", search.clone()).await;
    fail(&search).await;
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(search.state().await.status, CircuitStatus::HalfOpen);

    shipping.force_close().await;
    let health = manager.system_health().await;
    assert!(health.healthy);
    assert_eq!(health.total_breakers, 3);

    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_health_sweep_reports_degradation() -> Result<()> {
    let manager = CircuitBreakerManager::with_health_check_interval(Duration::from_millis(100));
    let mut events = manager.subscribe();

    let ledger = breaker("ledger", 5);
    manager.register("ledger", ledger.clone()).await;

    match next_event(&mut events).await? {
        ManagerEvent::HealthCheck { health } => assert!(health.healthy),
        other => panic!("unexpected event: {:?}", other),
    }

    ledger.force_open().await;

    match next_event(&mut events).await? {
        ManagerEvent::HealthCheck { health } => assert!(!health.healthy),
        other => panic!("unexpected event: {:?}", other),
    }
    match next_event(&mut events).await? {
        ManagerEvent::SystemDegraded { health } => {
            assert_eq!(health.open_breakers, vec!["ledger"]);
            assert_eq!(health.total_breakers, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_replacing_registration() -> Result<()> {
    let manager = quiet_manager();
    let mut events = manager.subscribe();

    let old = breaker("cache-old", 1);
    let new = breaker("cache-new", 1);
    manager.register("cache", old.clone()).await;
    manager.register("cache", new.clone()).await;

    assert_eq!(manager.len().await, 1);
    assert_eq!(manager.get("cache").await.map(|b| b.name().to_string()), Some("cache-new".to_string()));
    assert!(!old.is_destroyed());

    // Only the current registration is forwarded
    fail(&old).await;
    fail(&new).await;

    match next_event(&mut events).await? {
        ManagerEvent::BreakerOpened { event, .. } => assert_eq!(event.breaker, "cache-new"),
        other => panic!("unexpected event: {:?}", other),
    }

    old.destroy();
    manager.destroy().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_destroy_tears_down_breakers() -> Result<()> {
    let manager = quiet_manager();
    let mut events = manager.subscribe();

    let orders = breaker("orders", 1);
    manager.register("orders", orders.clone()).await;

    manager.destroy().await;
    manager.destroy().await;

    assert!(manager.is_destroyed());
    assert!(orders.is_destroyed());
    assert!(manager.is_empty().await);
    assert!(matches!(events.recv().await, Err(RecvError::Closed)));

    // A destroyed breaker still runs calls but schedules nothing
    fail(&orders).await;
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(orders.state().await.status, CircuitStatus::Open);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_register_after_destroy_is_ignored() -> Result<()> {
    let manager = quiet_manager();
    manager.destroy().await;

    let late = breaker("late", 1);
    manager.register("late", late.clone()).await;

    assert!(manager.is_empty().await);
    assert!(manager.get("late").await.is_none());
    assert_eq!(manager.system_health().await.total_breakers, 0);

    // The rejected breaker is the caller's to manage
    assert!(!late.is_destroyed());
    fail(&late).await;
    assert_eq!(late.state().await.status, CircuitStatus::Open);

    late.destroy();
    Ok(())
}
