use std::sync::Arc;
use std::time::Duration;

use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{ClientId, Credential, SessionId, Target};
use sm_session::mock::MockConnector;
use sm_session::pool::{ConnectionPool, PoolSettings};
use sm_session::registry::{RegistrySettings, SessionError, SessionRegistry};
use sm_session::session::{CloseReason, SessionEvent};
use sm_session::transport::PtySize;
use tokio::sync::mpsc;

fn registry_with(connector: &MockConnector, session_timeout: Duration) -> SessionRegistry {
    let pool = ConnectionPool::new(
        Arc::new(connector.clone()),
        PoolSettings {
            max_connections: 4,
            idle_ttl: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            reap_interval: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(3600),
        },
    );
    SessionRegistry::new(
        pool,
        RegistrySettings {
            session_timeout,
            sweep_interval: Duration::from_secs(1),
            flush_timeout: Duration::from_millis(200),
            shell_timeout: Duration::from_secs(1),
            default_size: PtySize::default(),
        },
    )
}

fn target(host: &str) -> Target {
    Target::new(host, 22, "deploy")
}

async fn next(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event sink closed")
}

async fn open(
    registry: &SessionRegistry,
    host: &str,
) -> (SessionId, mpsc::Receiver<SessionEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let id = registry
        .create_session(target(host), &Credential::password("pw"), ClientId::new(), tx)
        .await
        .expect("create_session");
    assert_eq!(next(&mut rx).await, SessionEvent::Opened { session_id: id });
    (id, rx)
}

async fn wait_closed(rx: &mut mpsc::Receiver<SessionEvent>) -> CloseReason {
    loop {
        if let SessionEvent::Closed { reason, .. } = next(rx).await {
            return reason;
        }
    }
}

#[tokio::test]
async fn output_arrives_in_order() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (id, mut rx) = open(&registry, "h").await;

    for chunk in ["ls\n", "pwd\n", "whoami\n"] {
        registry.send_input(id, chunk.as_bytes().to_vec()).await.unwrap();
    }

    let mut seen = String::new();
    while seen.len() < "ls\npwd\nwhoami\n".len() {
        match next(&mut rx).await {
            SessionEvent::Output { session_id, data } => {
                assert_eq!(session_id, id);
                seen.push_str(&data);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(seen, "ls\npwd\nwhoami\n");
    assert_eq!(registry.stats().active, 1);
}

#[tokio::test]
async fn close_session_releases_handle_and_rejects_later_input() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (id, mut rx) = open(&registry, "h").await;

    registry.close_session(id).await.unwrap();
    assert_eq!(wait_closed(&mut rx).await, CloseReason::Requested);

    let err = registry.send_input(id, b"ls\n".to_vec()).await.unwrap_err();
    assert_eq!(err, SessionError::NotFound(id));
    assert_eq!(err.code(), ErrorCode::SessionNotFound);
    assert_eq!(
        registry.close_session(id).await.unwrap_err().code(),
        ErrorCode::SessionNotFound
    );

    assert!(registry.describe(id).is_none());
    let pool = registry.pool().stats();
    assert_eq!(pool.idle, 1);
    assert_eq!(pool.in_use, 0);
    assert_eq!(registry.stats().closed_total, 1);
}

#[tokio::test]
async fn closed_session_handle_is_reused_for_same_target() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));

    let (first, _rx1) = open(&registry, "h").await;
    registry.close_session(first).await.unwrap();
    let (_second, _rx2) = open(&registry, "h").await;

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(connector.shells_opened(), 2);
}

#[tokio::test]
async fn remote_drop_closes_only_that_session_with_error() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (id, mut rx) = open(&registry, "h").await;

    connector.drop_all();
    let reason = wait_closed(&mut rx).await;
    let (code, _) = reason.as_error().expect("remote drop should be an error");
    assert_eq!(code, ErrorCode::ConnectFailed);

    assert!(registry.describe(id).is_none());
    assert_eq!(registry.pool().stats().size, 0);
}

#[tokio::test]
async fn remote_exit_is_a_clean_close() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (_id, mut rx) = open(&registry, "h").await;

    connector.hang_up_all();
    assert_eq!(wait_closed(&mut rx).await, CloseReason::RemoteClosed);
    assert_eq!(registry.pool().stats().idle, 1);
}

#[tokio::test]
async fn idle_sessions_are_swept() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_millis(50));
    let (_idle, mut idle_rx) = open(&registry, "h").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.sweep_idle(), 1);
    assert_eq!(wait_closed(&mut idle_rx).await, CloseReason::IdleTimeout);
}

#[tokio::test]
async fn touch_keeps_session_alive() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_millis(150));
    let (id, _rx) = open(&registry, "h").await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.touch(id).unwrap();
    }
    assert_eq!(registry.sweep_idle(), 0);
    assert!(registry.describe(id).is_some());
}

#[tokio::test]
async fn dropped_sink_closes_session() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (id, rx) = open(&registry, "h").await;
    drop(rx);

    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.describe(id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should close once its owner is gone");
    assert_eq!(registry.stats().active, 0);
}

#[tokio::test]
async fn failed_create_registers_nothing() {
    let connector = MockConnector::new()
        .reject_auth("locked")
        .unreachable("down")
        .fail_shell("noshell");
    let registry = registry_with(&connector, Duration::from_secs(60));
    let cred = Credential::password("pw");

    for (host, code) in [
        ("locked", ErrorCode::AuthFailed),
        ("down", ErrorCode::ConnectFailed),
        ("noshell", ErrorCode::HandshakeFailed),
    ] {
        let (tx, _rx) = mpsc::channel(8);
        let err = registry
            .create_session(target(host), &cred, ClientId::new(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), code, "host {host}");
    }

    let stats = registry.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.connecting, 0);
    assert_eq!(stats.failed_total, 3);
    assert_eq!(registry.pool().stats().size, 0);
}

#[tokio::test]
async fn resize_validates_and_forwards() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (id, _rx) = open(&registry, "h").await;

    let err = registry.resize(id, 0, 24).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtocolError);

    registry.resize(id, 132, 43).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(connector.resizes().contains(&PtySize { cols: 132, rows: 43 }));
}

#[tokio::test]
async fn close_all_closes_every_session() {
    let connector = MockConnector::new();
    let registry = registry_with(&connector, Duration::from_secs(60));
    let (_a, _ra) = open(&registry, "a").await;
    let (_b, _rb) = open(&registry, "b").await;
    let (_c, _rc) = open(&registry, "a").await;

    assert_eq!(registry.list().len(), 3);
    assert_eq!(registry.close_all().await, 3);
    assert!(registry.list().is_empty());
    assert_eq!(registry.stats().closed_total, 3);
}
