//! Start, stop and registration behaviour of the runtime.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{WAIT, eventually, start, test_config};
use mdk::{ChannelState, Flow, LogEvent, Mdk, MdkError, Severity};
use mdk_protocol::MessageKind;
use mdk_transport::testing::FakeBackend;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn stop_is_idempotent() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    assert!(mdk.wait_connected(WAIT).await);

    mdk.stop().await;
    mdk.stop().await;

    assert!(mdk.is_stopped());
    assert_eq!(mdk.channel_state(), ChannelState::Closed);
    assert!(eventually(WAIT, || backend.open_connections() == 0).await);
}

#[tokio::test]
async fn stop_sends_close() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    assert!(mdk.wait_connected(WAIT).await);

    mdk.stop().await;
    assert!(eventually(WAIT, || !backend.received_kind(MessageKind::Close).is_empty()).await);
}

#[tokio::test]
async fn stop_cancels_pending_resolutions() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let session = mdk.session();

    let pending = tokio::spawn(async move { session.resolve_until("never", "1.0", 30.0).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    mdk.stop().await;
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();

    assert!(matches!(result, Err(MdkError::ChannelClosed)), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(mdk.resolver().pending(), 0);
}

#[tokio::test]
async fn operations_after_stop() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let session = mdk.session();
    mdk.stop().await;

    assert!(matches!(
        session.resolve_until("svc", "1.0", 1.0).await,
        Err(MdkError::ChannelClosed)
    ));
    assert!(matches!(
        mdk.tracer().subscribe(|_: &LogEvent| Flow::Continue).await,
        Err(MdkError::ChannelClosed)
    ));
    assert!(matches!(
        mdk.register("svc", "1.0", "s:1").await,
        Err(MdkError::ChannelClosed)
    ));

    // Logging after stop is silently dropped.
    session.error("late", "nobody hears this");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.received_logs().iter().all(|event| event.category != "late"));
}

#[tokio::test]
async fn registration_is_advertised_and_expired_on_stop() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);

    let node = mdk.register("orders", "1.2.0", "10.1.1.1:9000").await.unwrap();
    assert_eq!(node.environment, mdk.environment());
    assert!(
        eventually(WAIT, || backend
            .nodes()
            .iter()
            .any(|n| n.service == "orders" && n.address == "10.1.1.1:9000"))
        .await
    );

    mdk.stop().await;
    assert!(eventually(WAIT, || backend.nodes().is_empty()).await);
}

#[tokio::test]
async fn registration_rejects_empty_fields() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);

    assert!(matches!(
        mdk.register("", "1.0", "a:1").await,
        Err(MdkError::InvalidArgument(_))
    ));
    assert!(matches!(
        mdk.register("svc", " ", "a:1").await,
        Err(MdkError::InvalidArgument(_))
    ));
    mdk.stop().await;
}

#[tokio::test]
async fn registration_is_repeated_after_reconnect() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);

    let node = mdk.register("sticky", "1.0", "s:1").await.unwrap();
    assert!(eventually(WAIT, || backend.nodes().len() == 1).await);

    // The backend forgets the node, as it would after losing the session.
    backend.expire(&node);
    assert!(backend.nodes().is_empty());
    backend.disconnect_all();

    assert!(eventually(WAIT, || backend.total_connections() == 2).await);
    assert!(eventually(WAIT, || backend.nodes().len() == 1).await);
    mdk.stop().await;
}

#[tokio::test]
async fn runtimes_are_independent() {
    let backend = FakeBackend::new();
    let first = start(&backend);
    let second = start(&backend);
    assert_ne!(first.node_id(), second.node_id());

    first.stop().await;
    assert!(first.is_stopped());
    assert!(!second.is_stopped());

    second.register("alive", "1.0", "a:1").await.unwrap();
    assert_eq!(
        second
            .session()
            .resolve_until("alive", "1.0", 5.0)
            .await
            .unwrap()
            .address,
        "a:1"
    );
    second.stop().await;
}

#[tokio::test]
async fn stop_releases_subscribers() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let calls = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&calls);
    let handle = mdk
        .tracer()
        .subscribe(move |_: &LogEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        })
        .await
        .unwrap();
    assert_eq!(mdk.tracer().subscriber_count(), 1);

    mdk.stop().await;
    assert_eq!(mdk.tracer().subscriber_count(), 0);
    assert!(!handle.is_active());
}

#[tokio::test]
async fn stop_flushes_logs_before_ending_subscriptions() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    assert!(mdk.wait_connected(WAIT).await);
    let handle = mdk
        .tracer()
        .subscribe(|_: &LogEvent| Flow::Continue)
        .await
        .unwrap();

    let session = mdk.session();
    session.info("shutdown", "last words");
    mdk.stop().await;

    assert!(
        eventually(WAIT, || backend
            .received_logs()
            .iter()
            .any(|event| event.text == "last words" && event.session == session.trace_id()))
        .await
    );
    assert!(!handle.is_active());
    assert_eq!(mdk.tracer().subscriber_count(), 0);
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_connection() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    assert!(mdk.wait_connected(WAIT).await);
    assert_eq!(backend.open_connections(), 1);

    drop(mdk);
    assert!(eventually(WAIT, || backend.open_connections() == 0).await);
}

#[test]
fn start_requires_a_tokio_runtime() {
    let backend = FakeBackend::new();
    let result = Mdk::builder()
        .with_config(test_config())
        .with_connector(backend.connector())
        .start();
    assert!(matches!(result, Err(MdkError::Configuration(_))));
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let result = Mdk::builder()
        .with_config(test_config().with_server_url(""))
        .start();
    assert!(matches!(result, Err(MdkError::Configuration(_))));

    let result = Mdk::builder()
        .with_config(test_config().with_environment(""))
        .start();
    assert!(matches!(result, Err(MdkError::Configuration(_))));
}

#[tokio::test]
async fn join_rejects_garbage() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);

    assert!(matches!(mdk.join("not a context"), Err(MdkError::Protocol(_))));
    mdk.stop().await;
}

#[tokio::test]
async fn trace_level_travels_with_the_context() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);

    let mut session = mdk.session();
    assert_eq!(session.trace_level(), None);
    session.trace(Severity::Info);

    let joined = mdk.join(&session.externalize().unwrap()).unwrap();
    assert_eq!(joined.trace_id(), session.trace_id());
    assert_eq!(joined.trace_level(), Some(Severity::Info));

    let fresh = mdk.session();
    assert_ne!(fresh.trace_id(), session.trace_id());
    mdk.stop().await;
}
