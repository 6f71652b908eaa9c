//! The subscriber bus for inbound log events.
//!
//! Events pushed by the backend are deduplicated by id and fanned out to
//! every matching subscription. Each subscription owns a bounded queue and a
//! task, so a slow or failing subscriber never delays the others, and events
//! reach each subscriber in the order the channel received them.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mdk_protocol::{LogEvent, Message, MessageKind, Severity};
use mdk_transport::TransportChannel;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dedup::SeenEvents;
use crate::error::{MdkError, Result, SubscriberError};

const SUBSCRIBE_ANNOUNCEMENT: &str = "tracer/subscribe";

/// What a subscriber wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep delivering events
    Continue,
    /// Remove this subscription
    Stop,
}

/// Receives log events from the bus.
///
/// `handle` runs on the subscription's own task; it should not block for
/// long. Returning [`Flow::Stop`] or an error, or panicking, ends the
/// subscription.
pub trait LogSubscriber: Send + 'static {
    /// Handles one event.
    fn handle(&mut self, event: &LogEvent) -> std::result::Result<Flow, SubscriberError>;
}

impl<F> LogSubscriber for F
where
    F: FnMut(&LogEvent) -> Flow + Send + 'static,
{
    fn handle(&mut self, event: &LogEvent) -> std::result::Result<Flow, SubscriberError> {
        Ok(self(event))
    }
}

/// Selects which events a subscription receives. Empty fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events of this category
    pub category: Option<String>,
    /// Only events at or above this severity
    pub min_severity: Option<Severity>,
    /// Only events of this trace id
    pub session: Option<String>,
}

impl EventFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Restrict to a minimum severity
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Restrict to one trace
    pub fn session(mut self, trace_id: impl Into<String>) -> Self {
        self.session = Some(trace_id.into());
        self
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &LogEvent) -> bool {
        self.category.as_ref().is_none_or(|c| *c == event.category)
            && self.min_severity.is_none_or(|s| event.severity >= s)
            && self.session.as_ref().is_none_or(|s| *s == event.session)
    }
}

#[derive(Debug)]
struct Slot {
    filter: EventFilter,
    tx: mpsc::Sender<LogEvent>,
    token: CancellationToken,
}

struct TracerInner {
    channel: TransportChannel,
    subscribers: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    seen: Mutex<SeenEvents>,
    queue_capacity: usize,
    announced: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to the subscriber bus of one runtime.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("subscribers", &self.subscriber_count())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

/// A live subscription.
///
/// Dropping the handle does not end the subscription; call
/// [`unsubscribe`](SubscriptionHandle::unsubscribe).
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    token: CancellationToken,
    tracer: Weak<TracerInner>,
}

impl SubscriptionHandle {
    /// Identifier of this subscription within its tracer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ends the subscription. Once this returns no further event is handed
    /// to the subscriber, even when called from inside its own `handle`.
    pub fn unsubscribe(&self) {
        self.token.cancel();
        if let Some(tracer) = self.tracer.upgrade() {
            tracer.remove(self.id);
        }
    }

    /// Whether events are still being delivered.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Tracer {
    pub(crate) fn new(
        channel: TransportChannel,
        queue_capacity: usize,
        seen: SeenEvents,
    ) -> Self {
        let inner = Arc::new(TracerInner {
            channel: channel.clone(),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seen: Mutex::new(seen),
            queue_capacity: queue_capacity.max(1),
            announced: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        channel.on_message(
            MessageKind::Event,
            Arc::new(move |message: &Message| {
                if let (Some(inner), Message::Event { event }) = (weak.upgrade(), message) {
                    inner.publish(event);
                }
            }),
        );

        Self { inner }
    }

    /// Delivers every event to `subscriber`.
    pub async fn subscribe<S: LogSubscriber>(&self, subscriber: S) -> Result<SubscriptionHandle> {
        self.subscribe_filtered(EventFilter::default(), subscriber).await
    }

    /// Delivers events passing `filter` to `subscriber`.
    ///
    /// The first subscription asks the backend to start streaming events.
    ///
    /// # Errors
    /// [`MdkError::ChannelClosed`] once the runtime is stopped.
    pub async fn subscribe_filtered<S: LogSubscriber>(
        &self,
        filter: EventFilter,
        subscriber: S,
    ) -> Result<SubscriptionHandle> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(MdkError::ChannelClosed);
        }

        if !inner.announced.swap(true, Ordering::SeqCst) {
            if let Err(e) = inner
                .channel
                .announce(SUBSCRIBE_ANNOUNCEMENT, Message::Subscribe)
                .await
            {
                inner.announced.store(false, Ordering::SeqCst);
                inner.channel.withdraw(SUBSCRIBE_ANNOUNCEMENT);
                return Err(e.into());
            }
            tracing::debug!("Subscribed to backend log events");
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(inner.queue_capacity);
        let token = inner.shutdown.child_token();

        inner.subscribers.lock().insert(
            id,
            Slot {
                filter,
                tx,
                token: token.clone(),
            },
        );
        tokio::spawn(deliver(
            id,
            subscriber,
            rx,
            token.clone(),
            Arc::downgrade(inner),
        ));

        tracing::debug!(subscription = id, "Subscription added");
        Ok(SubscriptionHandle {
            id,
            token,
            tracer: Arc::downgrade(inner),
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Ends every subscription and ignores later events. Queued events are
    /// dropped.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let released = {
            let mut subscribers = self.inner.subscribers.lock();
            let released = subscribers.len();
            subscribers.clear();
            released
        };
        self.inner.seen.lock().clear();
        self.inner.channel.withdraw(SUBSCRIBE_ANNOUNCEMENT);
        tracing::debug!(released, "Tracer shut down");
    }
}

impl TracerInner {
    fn publish(&self, event: &LogEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.seen.lock().is_duplicate(&event.id) {
            tracing::trace!(event_id = %event.id, "Duplicate event suppressed");
            return;
        }

        let subscribers = self.subscribers.lock();
        for (id, slot) in subscribers.iter() {
            if slot.token.is_cancelled() || !slot.filter.matches(event) {
                continue;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscription = id, event_id = %event.id, "Subscriber queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn remove(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            tracing::debug!(subscription = id, "Subscription removed");
        }
    }
}

async fn deliver<S: LogSubscriber>(
    id: u64,
    mut subscriber: S,
    mut rx: mpsc::Receiver<LogEvent>,
    token: CancellationToken,
    tracer: Weak<TracerInner>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if token.is_cancelled() {
            break;
        }
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| subscriber.handle(&event)));
        match outcome {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::Stop)) => {
                tracing::debug!(subscription = id, "Subscriber asked to stop");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(subscription = id, "Subscriber failed, removing it: {}", e);
                break;
            }
            Err(_) => {
                tracing::error!(subscription = id, "Subscriber panicked, removing it");
                break;
            }
        }
    }

    token.cancel();
    if let Some(tracer) = tracer.upgrade() {
        tracer.remove(id);
    }
}
