//! Tests for eisv-lock: exclusion, timeouts, stale reclaim

use eisv_core::{system_clock, AgentId, ConfigHandle, Error, GovernanceConfig, ManualClock};
use eisv_lock::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager() -> Arc<LockManager> {
    Arc::new(LockManager::new(ConfigHandle::default(), system_clock()))
}

// ===========================================================================
// Exclusion
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_holder_under_contention() {
    let manager = manager();
    let agent = AgentId::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let inside = inside.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            let _guard = manager
                .acquire(agent, Duration::from_secs(5), 2)
                .await
                .unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!manager.is_locked(agent));
}

#[tokio::test]
async fn different_agents_do_not_contend() {
    let manager = manager();
    let _a = manager.lock(AgentId::new()).await.unwrap();
    let _b = manager
        .acquire(AgentId::new(), Duration::from_millis(50), 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn waiter_wakes_when_holder_releases() {
    let manager = manager();
    let agent = AgentId::new();
    let guard = manager.lock(agent).await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(agent, Duration::from_secs(2), 0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(guard);
    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.agent(), agent);
}

// ===========================================================================
// Timeouts
// ===========================================================================

#[tokio::test]
async fn timeout_is_retryable_lock_timeout() {
    let manager = manager();
    let agent = AgentId::new();
    let _held = manager.lock(agent).await.unwrap();

    let err = manager
        .acquire(agent, Duration::from_millis(60), 2)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    match err {
        Error::LockTimeout { waited_ms, .. } => assert!(waited_ms >= 50),
        other => panic!("expected LockTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn reloaded_timeout_applies_to_next_acquire() {
    let config = ConfigHandle::default();
    let manager = LockManager::new(config.clone(), system_clock());
    let agent = AgentId::new();
    let _held = manager.lock(agent).await.unwrap();

    let mut next = GovernanceConfig::default();
    next.lock.timeout_ms = 200;
    next.lock.max_retries = 0;
    config.replace(next);

    let started = std::time::Instant::now();
    let err = manager.lock(agent).await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn huge_retry_count_does_not_overflow() {
    let manager = manager();
    let agent = AgentId::new();
    let _held = manager.lock(agent).await.unwrap();
    // One attempt gets no time at all
    let err = manager
        .acquire(agent, Duration::ZERO, u32::MAX)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

// ===========================================================================
// Stale reclaim
// ===========================================================================

#[tokio::test]
async fn stale_heartbeat_is_reclaimed_on_acquire() {
    let clock = ManualClock::shared(chrono::Utc::now());
    let manager = LockManager::new(ConfigHandle::default(), clock.clone());
    let agent = AgentId::new();

    let dead = manager.lock(agent).await.unwrap().detach();
    clock.advance(chrono::Duration::seconds(11));

    let guard = manager
        .acquire(agent, Duration::from_millis(50), 0)
        .await
        .unwrap();
    assert_ne!(guard.token(), dead);
    assert_eq!(manager.reclaimed_count(), 1);
    assert!(manager.release(agent, dead).is_err());
}

#[tokio::test]
async fn heartbeat_keeps_lock_alive() {
    let clock = ManualClock::shared(chrono::Utc::now());
    let manager = LockManager::new(ConfigHandle::default(), clock.clone());
    let agent = AgentId::new();

    let guard = manager.lock(agent).await.unwrap();
    clock.advance(chrono::Duration::seconds(8));
    guard.heartbeat();
    clock.advance(chrono::Duration::seconds(8));

    assert!(manager
        .acquire(agent, Duration::from_millis(30), 0)
        .await
        .is_err());
    assert_eq!(manager.reap(), 0);
}

#[tokio::test]
async fn max_age_reclaims_even_with_heartbeat() {
    let clock = ManualClock::shared(chrono::Utc::now());
    let manager = LockManager::new(ConfigHandle::default(), clock.clone());
    let agent = AgentId::new();

    let token = manager.lock(agent).await.unwrap().detach();
    for _ in 0..7 {
        clock.advance(chrono::Duration::seconds(9));
        manager.heartbeat(agent, token).unwrap();
    }
    assert!(manager
        .acquire(agent, Duration::from_millis(30), 0)
        .await
        .is_ok());
}
