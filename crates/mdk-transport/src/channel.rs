//! The reconnecting transport channel.
//!
//! One background task owns the connection. Producers hand it messages via a
//! bounded queue (`send`), the acknowledged log outbox (`send_log`), or the
//! announcement list (`announce`), which is replayed on every new connection.
//! Inbound frames are decoded and passed to the handlers registered for their
//! [`MessageKind`]. Handlers run on the channel task and must not block.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mdk_protocol::{LogEvent, Message, MessageKind, PROTOCOL_VERSION};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelConfig;
use crate::connector::{Connection, Connector, FrameSink};
use crate::error::{TransportError, TransportResult};
use crate::outbox::{LogOutbox, OutboxStats};

/// Callback invoked for every inbound message of a registered kind.
pub type InboundHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Connection state of a [`TransportChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Dialing for the first time
    Connecting,
    /// Connected and greeted
    Connected,
    /// Lost the connection; backing off and dialing again
    Reconnecting,
    /// Shut down; terminal
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

enum Exit {
    Shutdown,
    Lost(String),
}

struct ChannelInner {
    endpoint: String,
    node_id: String,
    config: ChannelConfig,
    outbound: mpsc::Sender<Message>,
    handlers: RwLock<HashMap<MessageKind, Vec<InboundHandler>>>,
    announcements: Mutex<Vec<(String, Message)>>,
    outbox: Mutex<LogOutbox>,
    outbox_ready: Notify,
    state: watch::Sender<ChannelState>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the channel task. Cloning is cheap; all clones share one
/// connection.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("endpoint", &self.inner.endpoint)
            .field("node_id", &self.inner.node_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportChannel {
    /// Starts the channel task and returns immediately.
    ///
    /// The first connection is dialed in the background; messages sent before
    /// it is up wait in the queue. Must be called within a Tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        node_id: impl Into<String>,
        config: ChannelConfig,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(ChannelState::Connecting);

        let inner = Arc::new(ChannelInner {
            endpoint: connector.endpoint(),
            node_id: node_id.into(),
            outbox: Mutex::new(LogOutbox::new(config.outbox_capacity)),
            config,
            outbound,
            handlers: RwLock::new(HashMap::new()),
            announcements: Mutex::new(Vec::new()),
            outbox_ready: Notify::new(),
            state,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&inner).run(connector, outbound_rx));
        *inner.task.lock() = Some(task);

        Self { inner }
    }

    /// Endpoint description reported by the connector.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Process id announced in the `open` frame.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Registers a handler for inbound messages of `kind`.
    ///
    /// Several handlers may share a kind; they run in registration order.
    pub fn on_message(&self, kind: MessageKind, handler: InboundHandler) {
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(handler);
        tracing::debug!(%kind, "Inbound handler registered");
    }

    /// Queues a message for the current or next connection.
    ///
    /// Waits up to the configured enqueue timeout for queue space, then fails
    /// with [`TransportError::QueueFull`].
    pub async fn send(&self, message: Message) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        match self
            .inner
            .outbound
            .send_timeout(message, self.inner.config.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(message)) => {
                tracing::warn!(kind = %message.kind(), "Outbound queue full");
                Err(TransportError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }

    /// Hands a log event to the acknowledged outbox and returns its sequence.
    ///
    /// Never blocks. When the outbox is full the oldest unacknowledged event
    /// is dropped.
    pub fn send_log(&self, event: LogEvent) -> TransportResult<u64> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let (sequence, evicted) = self.inner.outbox.lock().push(event);
        if let Some(evicted) = evicted {
            tracing::warn!(event_id = %evicted.id, "Log outbox full, dropped oldest event");
        }
        self.inner.outbox_ready.notify_one();
        Ok(sequence)
    }

    /// Sends `message` now and again after every reconnect.
    ///
    /// Announcing under an existing key replaces the earlier message.
    pub async fn announce(&self, key: impl Into<String>, message: Message) -> TransportResult<()> {
        let key = key.into();
        {
            let mut announcements = self.inner.announcements.lock();
            match announcements.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = message.clone(),
                None => announcements.push((key, message.clone())),
            }
        }
        self.send(message).await
    }

    /// Stops replaying the announcement stored under `key`.
    pub fn withdraw(&self, key: &str) -> Option<Message> {
        let mut announcements = self.inner.announcements.lock();
        let index = announcements.iter().position(|(existing, _)| existing == key)?;
        Some(announcements.remove(index).1)
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Waits until the channel is connected. Returns `false` on timeout or if
    /// the channel closes first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, ChannelState::Connected | ChannelState::Closed)),
        )
        .await;
        matches!(reached, Ok(Ok(ref s)) if **s == ChannelState::Connected)
    }

    /// Counters of the log outbox.
    pub fn outbox_stats(&self) -> OutboxStats {
        self.inner.outbox.lock().stats()
    }

    /// Returns `true` once the channel has been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Completes when the channel starts shutting down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Signals the channel task to stop without waiting for it.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }

    /// Flushes queued messages within the grace window, says goodbye and
    /// closes the connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(endpoint = %self.inner.endpoint, "Transport channel shutdown initiated");
        self.inner.shutdown.cancel();

        let task = self.inner.task.lock().take();
        if let Some(mut task) = task {
            let limit = self.inner.config.shutdown_grace + Duration::from_millis(250);
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                tracing::warn!("Transport channel task did not stop in time, aborting");
                task.abort();
            }
        }
        self.inner.set_state(ChannelState::Closed);
    }
}

impl ChannelInner {
    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ChannelState::Closed {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(endpoint = %self.endpoint, state = %next, "Transport channel state changed");
        }
    }

    async fn run(self: Arc<Self>, connector: Arc<dyn Connector>, mut outbound_rx: mpsc::Receiver<Message>) {
        tracing::info!(endpoint = %self.endpoint, "Transport channel task started");
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.set_state(if ever_connected {
                ChannelState::Reconnecting
            } else {
                ChannelState::Connecting
            });

            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = connector.connect() => result,
            };

            let mut connection = match dialed {
                Ok(connection) => connection,
                Err(e) => {
                    let delay = self.config.reconnect.calculate_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        ?delay,
                        "Connection attempt failed: {}",
                        e
                    );
                    if !self.config.reconnect.enabled || self.sleep_or_shutdown(delay).await {
                        break;
                    }
                    continue;
                }
            };

            attempt = 0;
            ever_connected = true;

            let exit = match self.greet(&mut connection.sink, &mut outbound_rx).await {
                Ok(()) => {
                    self.set_state(ChannelState::Connected);
                    tracing::info!(endpoint = %self.endpoint, "Transport channel connected");
                    self.pump(&mut connection, &mut outbound_rx).await
                }
                Err(e) => Exit::Lost(e.to_string()),
            };

            match exit {
                Exit::Shutdown => {
                    self.drain(&mut connection.sink, &mut outbound_rx).await;
                    break;
                }
                Exit::Lost(reason) => {
                    drop(connection);
                    let requeued = self.outbox.lock().requeue();
                    tracing::warn!(endpoint = %self.endpoint, requeued, "Connection lost: {}", reason);
                    if !self.config.reconnect.enabled {
                        break;
                    }
                    let delay = self.config.reconnect.calculate_delay(0);
                    attempt = 1;
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        outbound_rx.close();
        self.set_state(ChannelState::Closed);
        tracing::info!(endpoint = %self.endpoint, "Transport channel task terminated");
    }

    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// `open`, then every announcement, then whatever is queued, then the
    /// whole outbox.
    async fn greet(
        &self,
        sink: &mut FrameSink,
        outbound_rx: &mut mpsc::Receiver<Message>,
    ) -> TransportResult<()> {
        let open = Message::Open {
            version: PROTOCOL_VERSION.to_string(),
            node: self.node_id.clone(),
        };
        self.write(sink, &open).await?;

        let announcements: Vec<Message> = self
            .announcements
            .lock()
            .iter()
            .map(|(_, message)| message.clone())
            .collect();
        for message in &announcements {
            self.write(sink, message).await?;
        }

        self.outbox.lock().requeue();
        self.flush(sink, outbound_rx).await
    }

    async fn pump(&self, connection: &mut Connection, outbound_rx: &mut mpsc::Receiver<Message>) -> Exit {
        loop {
            if let Err(e) = self.flush(&mut connection.sink, outbound_rx).await {
                return Exit::Lost(e.to_string());
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Exit::Shutdown,
                frame = connection.stream.next() => match frame {
                    Some(Ok(frame)) => self.dispatch(&frame),
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("stream ended".to_string()),
                },
                message = outbound_rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.write(&mut connection.sink, &message).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    None => return Exit::Shutdown,
                },
                _ = self.outbox_ready.notified() => {}
            }
        }
    }

    async fn drain(&self, sink: &mut FrameSink, outbound_rx: &mut mpsc::Receiver<Message>) {
        let flushed = tokio::time::timeout(self.config.shutdown_grace, async {
            self.flush(sink, outbound_rx).await?;
            let goodbye = Message::Close {
                reason: Some("shutdown".to_string()),
            };
            self.write(sink, &goodbye).await?;
            sink.close().await
        })
        .await;

        match flushed {
            Ok(Ok(())) => tracing::debug!("Outbound queue flushed on shutdown"),
            Ok(Err(e)) => tracing::debug!("Flush on shutdown failed: {}", e),
            Err(_) => tracing::warn!(
                grace = ?self.config.shutdown_grace,
                "Shutdown grace window elapsed with messages still queued"
            ),
        }
    }

    /// Writes queued messages, then unsent log events.
    ///
    /// The outbox is snapshotted before the queue is drained, so a message
    /// queued before a log event was handed over always goes out first.
    async fn flush(
        &self,
        sink: &mut FrameSink,
        outbound_rx: &mut mpsc::Receiver<Message>,
    ) -> TransportResult<()> {
        let batch = self.outbox.lock().take_unsent();
        while let Ok(message) = outbound_rx.try_recv() {
            self.write(sink, &message).await?;
        }
        for (sequence, event) in batch {
            self.write(sink, &Message::Log { sequence, event }).await?;
        }
        Ok(())
    }

    async fn write(&self, sink: &mut FrameSink, message: &Message) -> TransportResult<()> {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = %message.kind(), "Dropping message that failed to encode: {}", e);
                return Ok(());
            }
        };
        tracing::trace!(kind = %message.kind(), "Sending frame");
        sink.send(frame).await
    }

    fn dispatch(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) if e.is_ignorable() => {
                tracing::debug!("Ignoring inbound frame: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!("Discarding malformed inbound frame: {}", e);
                return;
            }
        };

        if let Message::LogAck { sequence } = message {
            let released = self.outbox.lock().ack(sequence);
            tracing::trace!(sequence, released, "Log acknowledgement");
        }

        let kind = message.kind();
        let handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();
        if handlers.is_empty() {
            tracing::trace!(%kind, "No handler registered");
        }
        for handler in handlers {
            handler(&message);
        }
    }
}
