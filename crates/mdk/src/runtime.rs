//! The MDK runtime handle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mdk_protocol::{Message, Node, SessionContext};
use mdk_transport::{ChannelState, Connector, TransportChannel};
use parking_lot::Mutex;

use crate::config::MdkConfig;
use crate::dedup::SeenEvents;
use crate::error::{MdkError, Result};
use crate::resolver::Resolver;
use crate::session::Session;
use crate::tracer::Tracer;

pub(crate) struct RuntimeInner {
    pub(crate) node_id: String,
    pub(crate) config: MdkConfig,
    pub(crate) channel: TransportChannel,
    pub(crate) resolver: Resolver,
    pub(crate) tracer: Tracer,
    registrations: Mutex<Vec<Node>>,
    stopped: AtomicBool,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(node_id = %self.node_id, "MDK runtime dropped without stop");
            self.tracer.shutdown();
            self.channel.close();
        }
    }
}

fn registration_key(node: &Node) -> String {
    format!("node/{}/{}/{}", node.environment, node.service, node.address)
}

/// A running MDK instance.
///
/// Owns one transport channel shared by discovery and tracing. Runtimes are
/// independent of each other; a process may run any number of them. Clones
/// share the same runtime.
///
/// # Example
///
/// ```rust,no_run
/// use mdk::{Mdk, MdkConfig};
///
/// # async fn example() -> mdk::Result<()> {
/// let mdk = Mdk::start(MdkConfig::from_env()?)?;
/// let session = mdk.session();
///
/// let node = session.resolve_until("billing", "1.0", 10.0).await?;
/// session.info("checkout", format!("billing is at {}", node.address));
///
/// mdk.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Mdk {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Mdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mdk")
            .field("node_id", &self.inner.node_id)
            .field("environment", &self.inner.config.environment)
            .field("channel", &self.inner.channel)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Builder for [`Mdk`].
#[derive(Debug, Default)]
pub struct MdkBuilder {
    config: MdkConfig,
    connector: Option<Arc<dyn Connector>>,
    node_id: Option<String>,
}

impl MdkBuilder {
    /// Starts from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn with_config(mut self, config: MdkConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom connector instead of dialing `server_url`
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the process identity stamped on events (default: random UUID)
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Validates the configuration and starts the runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<Mdk> {
        let mut config = self.config;
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MdkError::Configuration(
                "Mdk must be started from within a Tokio runtime".into(),
            ));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&config)?,
        };
        let node_id = self
            .node_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        config.channel.shutdown_grace = config.stop_grace;
        let channel = TransportChannel::spawn(connector, node_id.clone(), config.channel.clone());
        let resolver = Resolver::new(
            channel.clone(),
            config.environment.clone(),
            config.resolve_backoff.clone(),
            config.circuit_breaker.clone(),
        );
        let tracer = Tracer::new(
            channel.clone(),
            config.subscriber_queue_capacity,
            SeenEvents::new(config.dedup_capacity, config.dedup_ttl),
        );

        tracing::info!(
            node_id = %node_id,
            endpoint = %channel.endpoint(),
            environment = %config.environment,
            "MDK runtime started"
        );

        Ok(Mdk {
            inner: Arc::new(RuntimeInner {
                node_id,
                config,
                channel,
                resolver,
                tracer,
                registrations: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(feature = "websocket")]
fn default_connector(config: &MdkConfig) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(mdk_transport::WebSocketConnector::new(
        config.server_url.clone(),
    )?))
}

#[cfg(not(feature = "websocket"))]
fn default_connector(_config: &MdkConfig) -> Result<Arc<dyn Connector>> {
    Err(MdkError::Configuration(
        "no connector configured and the websocket feature is disabled".into(),
    ))
}

impl Mdk {
    /// Starts building a runtime.
    pub fn builder() -> MdkBuilder {
        MdkBuilder::new()
    }

    /// Starts a runtime that dials `config.server_url`.
    pub fn start(config: MdkConfig) -> Result<Self> {
        Self::builder().with_config(config).start()
    }

    /// Begins a new trace, with the configured default deadline if any.
    pub fn session(&self) -> Session {
        let mut context = SessionContext::new();
        if let Some(deadline) = self.inner.config.default_deadline {
            context.set_deadline(deadline);
        }
        Session::new(Arc::clone(&self.inner), context)
    }

    /// Continues a trace exported by [`Session::externalize`].
    ///
    /// # Errors
    /// [`MdkError::Protocol`] if `encoded` is not a session context.
    pub fn join(&self, encoded: &str) -> Result<Session> {
        let context = SessionContext::decode(encoded)?;
        Ok(Session::new(Arc::clone(&self.inner), context))
    }

    /// The subscriber bus.
    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    /// The discovery resolver.
    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// Process identity stamped on every event.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Environment used for registration and resolution.
    pub fn environment(&self) -> &str {
        &self.inner.config.environment
    }

    /// The configuration this runtime started with.
    pub fn config(&self) -> &MdkConfig {
        &self.inner.config
    }

    /// Connection state of the transport channel.
    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    /// Waits until the backend connection is up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.inner.channel.wait_connected(timeout).await
    }

    /// Advertises a node of this process.
    ///
    /// The registration is repeated after every reconnect and withdrawn by
    /// [`stop`](Self::stop).
    ///
    /// # Errors
    /// [`MdkError::InvalidArgument`] for empty fields,
    /// [`MdkError::ChannelClosed`] after `stop`.
    pub async fn register(&self, service: &str, version: &str, address: &str) -> Result<Node> {
        if self.is_stopped() {
            return Err(MdkError::ChannelClosed);
        }
        for (name, value) in [("service", service), ("version", version), ("address", address)] {
            if value.trim().is_empty() {
                return Err(MdkError::InvalidArgument(format!("{name} must not be empty")));
            }
        }

        let node = Node::new(service, version, address)
            .with_environment(self.inner.config.environment.clone());
        let key = registration_key(&node);
        {
            let mut registrations = self.inner.registrations.lock();
            registrations.retain(|existing| registration_key(existing) != key);
            registrations.push(node.clone());
        }

        self.inner
            .channel
            .announce(key, Message::NodeActive { node: node.clone() })
            .await?;
        tracing::info!(%node, "Registered node");
        Ok(node)
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Withdraws registrations, flushes what is queued within the stop grace
    /// window, closes the connection and then ends every subscription.
    ///
    /// Pending resolutions fail with [`MdkError::ChannelClosed`]. Calling
    /// `stop` again does nothing.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node_id = %self.inner.node_id, "Stopping MDK runtime");

        let registrations = std::mem::take(&mut *self.inner.registrations.lock());
        for node in registrations {
            self.inner.channel.withdraw(&registration_key(&node));
            if let Err(e) = self.inner.channel.send(Message::NodeExpired { node }).await {
                tracing::debug!("Expiry not sent: {}", e);
            }
        }

        self.inner.channel.shutdown().await;
        self.inner.tracer.shutdown();
        self.inner.resolver.shutdown();
        tracing::info!(node_id = %self.inner.node_id, "MDK runtime stopped");
    }
}
