use std::sync::Arc;
use std::time::Duration;

use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{Credential, Target};
use sm_session::mock::MockConnector;
use sm_session::pool::{ConnectionPool, PoolError, PoolSettings};

fn settings(max: usize) -> PoolSettings {
    PoolSettings {
        max_connections: max,
        idle_ttl: Duration::from_secs(60),
        acquire_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        reap_interval: Duration::from_secs(60),
        max_lifetime: Duration::from_secs(3600),
    }
}

fn target(host: &str) -> Target {
    Target::new(host, 22, "deploy")
}

fn pool_with(connector: &MockConnector, settings: PoolSettings) -> ConnectionPool {
    ConnectionPool::new(Arc::new(connector.clone()), settings)
}

#[tokio::test]
async fn acquire_waits_at_capacity_and_reuses_released_handle() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(2));
    let cred = Credential::password("pw");

    let h1 = pool.acquire(&target("a"), &cred).await.unwrap();
    let h2 = pool.acquire(&target("a"), &cred).await.unwrap();
    assert_eq!(pool.stats().size, 2);
    assert_eq!(pool.stats().in_use, 2);

    let waiter = {
        let pool = pool.clone();
        let cred = cred.clone();
        tokio::spawn(async move { pool.acquire(&target("a"), &cred).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "third acquire should be queued");
    assert_eq!(pool.stats().waiting, 1);

    pool.release(h1);
    let h3 = waiter.await.unwrap().expect("waiter should get the released handle");

    let stats = pool.stats();
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.size, 2);
    assert_eq!(stats.waiting, 0);

    pool.release(h2);
    pool.release(h3);
    assert_eq!(pool.stats().idle, 2);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn acquire_times_out_with_pool_exhausted() {
    let connector = MockConnector::new();
    let mut s = settings(1);
    s.acquire_timeout = Duration::from_millis(80);
    let pool = pool_with(&connector, s);
    let cred = Credential::password("pw");

    let _held = pool.acquire(&target("a"), &cred).await.unwrap();
    let err = pool.acquire(&target("a"), &cred).await.unwrap_err();

    assert!(matches!(err, PoolError::Exhausted { max: 1, .. }));
    assert_eq!(err.code(), ErrorCode::PoolExhausted);
    assert_eq!(pool.stats().exhausted, 1);
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn idle_handles_only_match_same_credential() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(4));

    let h = pool
        .acquire(&target("a"), &Credential::password("first"))
        .await
        .unwrap();
    pool.release(h);

    let other = pool
        .acquire(&target("a"), &Credential::password("second"))
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(pool.stats().reused, 0);
    assert_eq!(pool.stats().idle, 1);
    pool.release(other);

    let again = pool
        .acquire(&target("a"), &Credential::password("first"))
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(pool.stats().reused, 1);
    pool.release(again);
}

#[tokio::test]
async fn full_pool_evicts_idle_handle_of_other_target() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(1));
    let cred = Credential::password("pw");

    let a = pool.acquire(&target("a"), &cred).await.unwrap();
    pool.release(a);
    assert_eq!(pool.stats().idle, 1);

    let b = pool.acquire(&target("b"), &cred).await.unwrap();
    assert_eq!(b.key().map(|k| k.target.host.as_str()), Some("b"));

    let stats = pool.stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.size, 1);
    assert_eq!(stats.idle, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.close_count(), 1);
    pool.release(b);
}

#[tokio::test]
async fn connect_failures_free_capacity() {
    let connector = MockConnector::new().unreachable("down").reject_auth("locked");
    let pool = pool_with(&connector, settings(1));
    let cred = Credential::password("pw");

    let err = pool.acquire(&target("down"), &cred).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectFailed);

    let err = pool.acquire(&target("locked"), &cred).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthFailed);

    assert_eq!(pool.stats().size, 0);
    let ok = pool.acquire(&target("up"), &cred).await.unwrap();
    pool.release(ok);
}

#[tokio::test]
async fn slow_connect_is_bounded_by_connect_timeout() {
    let connector = MockConnector::new().with_connect_delay(Duration::from_millis(500));
    let mut s = settings(1);
    s.connect_timeout = Duration::from_millis(30);
    let pool = pool_with(&connector, s);

    let err = pool
        .acquire(&target("slow"), &Credential::password("pw"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectFailed);
    assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn releasing_dead_handle_discards_it() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(2));
    let h = pool
        .acquire(&target("a"), &Credential::password("pw"))
        .await
        .unwrap();

    connector.drop_all();
    pool.release(h);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.size, 0);
    assert_eq!(stats.discarded, 1);
}

#[tokio::test]
async fn dropped_handle_frees_its_slot() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(1));
    let h = pool
        .acquire(&target("a"), &Credential::password("pw"))
        .await
        .unwrap();
    drop(h);

    assert_eq!(pool.stats().size, 0);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn reaper_closes_expired_idle_handles() {
    let connector = MockConnector::new();
    let mut s = settings(2);
    s.idle_ttl = Duration::from_millis(40);
    let pool = pool_with(&connector, s);

    let h = pool
        .acquire(&target("a"), &Credential::password("pw"))
        .await
        .unwrap();
    pool.release(h);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = pool.reap().await;

    assert_eq!(report.expired, 1);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().size, 0);
    assert_eq!(pool.stats().reaped, 1);
}

#[tokio::test]
async fn reaper_probes_and_drops_unhealthy_handles() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(3));
    let cred = Credential::password("pw");

    let a = pool.acquire(&target("a"), &cred).await.unwrap();
    let b = pool.acquire(&target("b"), &cred).await.unwrap();
    pool.release(a);
    pool.release(b);

    let report = pool.reap().await;
    assert_eq!(report.kept, 2);
    assert_eq!(connector.probe_count(), 2);

    connector.mark_unhealthy_all();
    let report = pool.reap().await;
    assert_eq!(report.unhealthy, 2);
    assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_capacity() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(3));

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let h = pool
                    .acquire(&target("a"), &Credential::password("pw"))
                    .await
                    .unwrap();
                assert!(pool.stats().size <= 3);
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(h);
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    assert!(connector.connect_count() <= 3);
    assert_eq!(pool.stats().in_use, 0);
    assert_eq!(pool.stats().released, 12);
}

#[tokio::test]
async fn close_idle_shuts_every_idle_connection() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, settings(2));
    let cred = Credential::password("pw");
    let a = pool.acquire(&target("a"), &cred).await.unwrap();
    let b = pool.acquire(&target("b"), &cred).await.unwrap();
    pool.release(a);
    pool.release(b);

    assert_eq!(pool.close_idle().await, 2);
    assert_eq!(connector.close_count(), 2);
    assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn handle_released_into_another_pool_is_discarded_by_its_owner() {
    let connector = MockConnector::new();
    let owner = pool_with(&connector, settings(2));
    let stranger = pool_with(&connector, settings(2));
    let cred = Credential::password("pw");

    let handle = owner.acquire(&target("a"), &cred).await.unwrap();
    let before = stranger.stats();
    assert_eq!(owner.stats().in_use, 1);

    stranger.release(handle);

    assert_eq!(stranger.stats(), before);
    let stats = owner.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.released, 0);

    // The freed slot is usable again.
    let again = owner.acquire(&target("a"), &cred).await.unwrap();
    assert_eq!(connector.connect_count(), 2);
    owner.release(again);
    assert_eq!(owner.stats().idle, 1);
}
