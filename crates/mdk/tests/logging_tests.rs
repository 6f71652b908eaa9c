//! Log emission and the subscriber bus against an in-memory backend.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{WAIT, collector, eventually, start};
use mdk::{EventFilter, Flow, LogEvent, LogSubscriber, Severity, SubscriberError, SubscriptionHandle};
use mdk_transport::testing::FakeBackend;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn five_severities_reach_a_category_subscriber() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let texts = collector::<String>();

    let sink = Arc::clone(&texts);
    mdk.tracer()
        .subscribe_filtered(EventFilter::new().category("X"), move |event: &LogEvent| {
            sink.lock().push(event.text.clone());
            Flow::Continue
        })
        .await
        .unwrap();

    let mut session = mdk.session();
    session.trace(Severity::Debug);
    let category = "X";
    session.critical(category, format!("hello critical {category}"));
    session.error(category, format!("hello error {category}"));
    session.warn(category, format!("hello warn {category}"));
    session.info(category, format!("hello info {category}"));
    session.debug(category, format!("hello debug {category}"));
    session.info("other", "not for this subscriber");

    assert!(eventually(WAIT, || texts.lock().len() == 5).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut received = texts.lock().clone();
    received.sort();
    assert_eq!(
        received,
        vec![
            "hello critical X",
            "hello debug X",
            "hello error X",
            "hello info X",
            "hello warn X",
        ]
    );
    mdk.stop().await;
}

#[tokio::test]
async fn events_carry_session_node_and_severity() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let events = collector::<LogEvent>();

    let sink = Arc::clone(&events);
    mdk.tracer()
        .subscribe(move |event: &LogEvent| {
            sink.lock().push(event.clone());
            Flow::Continue
        })
        .await
        .unwrap();

    let session = mdk.session();
    session.warn("stamps", "careful");

    assert!(eventually(WAIT, || events.lock().len() == 1).await);
    let event = events.lock()[0].clone();
    assert_eq!(event.session, session.trace_id());
    assert_eq!(event.node, mdk.node_id());
    assert_eq!(event.severity, Severity::Warn);
    assert_eq!(event.category, "stamps");
    assert_eq!(event.text, "careful");
    assert!(event.timestamp > 0);
    mdk.stop().await;
}

#[tokio::test]
async fn minimum_severity_filter() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let seen = collector::<Severity>();

    let sink = Arc::clone(&seen);
    mdk.tracer()
        .subscribe_filtered(
            EventFilter::new().category("levels").min_severity(Severity::Warn),
            move |event: &LogEvent| {
                sink.lock().push(event.severity);
                Flow::Continue
            },
        )
        .await
        .unwrap();

    let session = mdk.session();
    for severity in Severity::ALL {
        session.log(severity, "levels", severity.as_str());
    }

    assert!(eventually(WAIT, || seen.lock().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *seen.lock(),
        vec![Severity::Critical, Severity::Error, Severity::Warn]
    );
    mdk.stop().await;
}

#[tokio::test]
async fn events_arrive_in_emission_order() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let texts = collector::<String>();

    let sink = Arc::clone(&texts);
    mdk.tracer()
        .subscribe_filtered(EventFilter::new().category("order"), move |event: &LogEvent| {
            sink.lock().push(event.text.clone());
            Flow::Continue
        })
        .await
        .unwrap();

    let session = mdk.session();
    let expected: Vec<String> = (0..20).map(|i| format!("event {i}")).collect();
    for text in &expected {
        session.info("order", text.clone());
    }

    assert!(eventually(WAIT, || texts.lock().len() == expected.len()).await);
    assert_eq!(*texts.lock(), expected);
    mdk.stop().await;
}

#[tokio::test]
async fn joined_sessions_share_the_trace() {
    let backend = FakeBackend::new();
    let upstream = start(&backend);
    let downstream = start(&backend);
    let sessions = collector::<String>();

    let sink = Arc::clone(&sessions);
    upstream
        .tracer()
        .subscribe_filtered(EventFilter::new().category("handoff"), move |event: &LogEvent| {
            sink.lock().push(event.session.clone());
            Flow::Continue
        })
        .await
        .unwrap();

    let mut origin = upstream.session();
    origin.trace(Severity::Warn);
    let encoded = origin.externalize().unwrap();

    let joined = downstream.join(&encoded).unwrap();
    assert_eq!(joined.trace_id(), origin.trace_id());
    assert_eq!(joined.trace_level(), Some(Severity::Warn));

    origin.info("handoff", "sent");
    joined.info("handoff", "received");

    assert!(eventually(WAIT, || sessions.lock().len() == 2).await);
    assert!(sessions.lock().iter().all(|trace| trace == origin.trace_id()));
    upstream.stop().await;
    downstream.stop().await;
}

#[tokio::test]
async fn stop_during_an_event_ends_only_that_subscriber() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let stopper = Arc::new(AtomicUsize::new(0));
    let steady = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&stopper);
    mdk.tracer()
        .subscribe_filtered(EventFilter::new().category("stop"), move |_: &LogEvent| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                Flow::Stop
            } else {
                Flow::Continue
            }
        })
        .await
        .unwrap();
    let count = Arc::clone(&steady);
    mdk.tracer()
        .subscribe_filtered(EventFilter::new().category("stop"), move |_: &LogEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        })
        .await
        .unwrap();

    let session = mdk.session();
    for i in 0..4 {
        session.info("stop", format!("event {i}"));
    }

    assert!(eventually(WAIT, || steady.load(Ordering::SeqCst) == 4).await);
    assert_eq!(stopper.load(Ordering::SeqCst), 2);
    assert!(eventually(WAIT, || mdk.tracer().subscriber_count() == 1).await);
    mdk.stop().await;
}

#[tokio::test]
async fn unsubscribe_from_inside_the_callback() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let delivered = Arc::new(AtomicUsize::new(0));
    let handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

    let count = Arc::clone(&delivered);
    let own_handle = Arc::clone(&handle);
    let subscription = mdk
        .tracer()
        .subscribe_filtered(EventFilter::new().category("self"), move |_: &LogEvent| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                if let Some(handle) = own_handle.lock().as_ref() {
                    handle.unsubscribe();
                }
            }
            Flow::Continue
        })
        .await
        .unwrap();
    *handle.lock() = Some(subscription.clone());

    let session = mdk.session();
    for i in 0..5 {
        session.info("self", format!("event {i}"));
    }

    assert!(eventually(WAIT, || !subscription.is_active()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(mdk.tracer().subscriber_count(), 0);
    mdk.stop().await;
}

struct Failing {
    calls: Arc<AtomicUsize>,
}

impl LogSubscriber for Failing {
    fn handle(&mut self, _event: &LogEvent) -> Result<Flow, SubscriberError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SubscriberError::new("cannot write"))
    }
}

#[tokio::test]
async fn failing_and_panicking_subscribers_are_isolated() {
    let backend = FakeBackend::new();
    let mdk = start(&backend);
    let failing_calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicUsize::new(0));

    let filter = EventFilter::new().category("faults");
    mdk.tracer()
        .subscribe_filtered(
            filter.clone(),
            Failing {
                calls: Arc::clone(&failing_calls),
            },
        )
        .await
        .unwrap();
    mdk.tracer()
        .subscribe_filtered(filter.clone(), |_: &LogEvent| -> Flow {
            panic!("subscriber bug");
        })
        .await
        .unwrap();
    let count = Arc::clone(&healthy);
    mdk.tracer()
        .subscribe_filtered(filter, move |_: &LogEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        })
        .await
        .unwrap();
    assert_eq!(mdk.tracer().subscriber_count(), 3);

    let session = mdk.session();
    for i in 0..3 {
        session.error("faults", format!("event {i}"));
    }

    assert!(eventually(WAIT, || healthy.load(Ordering::SeqCst) == 3).await);
    assert!(eventually(WAIT, || mdk.tracer().subscriber_count() == 1).await);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    mdk.stop().await;
}

#[tokio::test]
async fn redelivered_events_are_suppressed() {
    let backend = FakeBackend::new();
    backend.set_ack_logs(false);
    let mdk = start(&backend);
    let delivered = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&delivered);
    mdk.tracer()
        .subscribe_filtered(EventFilter::new().category("dup"), move |_: &LogEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        })
        .await
        .unwrap();

    mdk.session().info("dup", "exactly once");
    assert!(eventually(WAIT, || backend.received_logs().len() == 1).await);

    backend.set_ack_logs(true);
    backend.disconnect_all();
    assert!(eventually(WAIT, || backend.received_logs().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    mdk.stop().await;
}

#[tokio::test]
async fn logs_emitted_while_disconnected_arrive_after_reconnect() {
    let backend = FakeBackend::new();
    let reader = start(&backend);
    let texts = collector::<String>();

    let sink = Arc::clone(&texts);
    reader
        .tracer()
        .subscribe_filtered(EventFilter::new().category("offline"), move |event: &LogEvent| {
            sink.lock().push(event.text.clone());
            Flow::Continue
        })
        .await
        .unwrap();
    assert!(reader.wait_connected(WAIT).await);

    backend.set_refuse_connections(true);
    let writer = start(&backend);
    writer.session().info("offline", "buffered");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(texts.lock().is_empty());

    backend.set_refuse_connections(false);
    assert!(eventually(WAIT, || texts.lock().len() == 1).await);
    assert_eq!(texts.lock()[0], "buffered");
    reader.stop().await;
    writer.stop().await;
}
