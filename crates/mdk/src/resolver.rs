//! Service discovery: the local cluster cache and `resolve_until`.
//!
//! The cache is fed by everything the backend pushes (`node_active`,
//! `node_expired`, `replace_cluster`) and by non-empty `resolved` answers.
//! A resolution first looks in the cache; on a miss it asks the backend and
//! then waits for whichever comes first: the answer, a cache change, the
//! retry delay, the deadline, or the channel closing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use mdk_protocol::{Message, MessageKind, Node, version_match};
use mdk_transport::{TransportChannel, TransportError};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::ResolveBackoff;
use crate::error::{MdkError, Result};

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClusterKey {
    service: String,
    environment: String,
}

impl ClusterKey {
    fn new(service: &str, environment: &str) -> Self {
        Self {
            service: service.to_string(),
            environment: environment.to_string(),
        }
    }

    fn of(node: &Node) -> Self {
        Self::new(&node.service, &node.environment)
    }
}

#[derive(Debug, Default)]
struct Cluster {
    nodes: Vec<Node>,
    cursor: usize,
}

impl Cluster {
    fn upsert(&mut self, node: Node) {
        match self
            .nodes
            .iter_mut()
            .find(|existing| existing.address == node.address)
        {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Round robin among available nodes matching `version`.
    fn choose(&mut self, version: &str, available: impl Fn(&Node) -> bool) -> Option<Node> {
        let matching: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.is_complete() && version_match(version, &node.version) && available(node)
            })
            .map(|(index, _)| index)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let index = matching[self.cursor % matching.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(self.nodes[index].clone())
    }
}

/// One outstanding `resolve` request and the time its retry is due.
struct InFlight<'a> {
    reply: oneshot::Receiver<Vec<Node>>,
    answered: bool,
    retry_at: Instant,
    _guard: WaiterGuard<'a>,
}

enum Wake {
    Reply(Option<Vec<Node>>),
    CacheChanged,
    RetryDue,
}

struct ResolverInner {
    channel: TransportChannel,
    environment: String,
    backoff: ResolveBackoff,
    clusters: DashMap<ClusterKey, Cluster>,
    waiters: DashMap<u64, oneshot::Sender<Vec<Node>>>,
    next_request_id: AtomicU64,
    changed: Notify,
    breakers: DashMap<String, CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
}

/// Resolves service names to nodes.
///
/// Obtained from [`Mdk::resolver`](crate::Mdk::resolver); sessions use it
/// through [`Session::resolve_until`](crate::Session::resolve_until).
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("environment", &self.inner.environment)
            .field("clusters", &self.inner.clusters.len())
            .field("pending", &self.inner.waiters.len())
            .finish()
    }
}

/// Removes a response waiter however the resolution attempt ends.
struct WaiterGuard<'a> {
    waiters: &'a DashMap<u64, oneshot::Sender<Vec<Node>>>,
    request_id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.request_id);
    }
}

impl Resolver {
    /// Creates a resolver and wires its handlers into `channel`.
    pub(crate) fn new(
        channel: TransportChannel,
        environment: impl Into<String>,
        backoff: ResolveBackoff,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let inner = Arc::new(ResolverInner {
            channel: channel.clone(),
            environment: environment.into(),
            backoff,
            clusters: DashMap::new(),
            waiters: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            changed: Notify::new(),
            breakers: DashMap::new(),
            breaker_config,
        });

        for kind in [
            MessageKind::Resolved,
            MessageKind::NodeActive,
            MessageKind::NodeExpired,
            MessageKind::ReplaceCluster,
        ] {
            let weak: Weak<ResolverInner> = Arc::downgrade(&inner);
            channel.on_message(
                kind,
                Arc::new(move |message: &Message| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle(message);
                    }
                }),
            );
        }

        Self { inner }
    }

    /// Environment this resolver searches.
    pub fn environment(&self) -> &str {
        &self.inner.environment
    }

    /// Waits until a node of `service` compatible with `version` is known.
    ///
    /// Returns immediately when the cache already holds one. Otherwise the
    /// backend is asked, and asked again after a jittered delay, until a
    /// node appears or `timeout` elapses.
    ///
    /// # Errors
    /// - [`MdkError::InvalidArgument`] for an empty service or zero timeout
    /// - [`MdkError::ResolutionTimeout`] when the deadline passes
    /// - [`MdkError::ChannelClosed`] when the runtime stops while waiting
    pub async fn resolve_until(&self, service: &str, version: &str, timeout: Duration) -> Result<Node> {
        if service.trim().is_empty() {
            return Err(MdkError::InvalidArgument("service name must not be empty".into()));
        }
        if timeout.is_zero() {
            return Err(MdkError::InvalidArgument("timeout must be positive".into()));
        }

        let inner = &self.inner;
        let start = Instant::now();
        let deadline = start.checked_add(timeout).unwrap_or(start + FAR_FUTURE);
        let expired = || MdkError::ResolutionTimeout {
            service: service.to_string(),
            version: version.to_string(),
            elapsed: start.elapsed(),
        };
        let mut attempt: u32 = 0;
        let mut in_flight: Option<InFlight<'_>> = None;

        tracing::debug!(service, version, ?timeout, "Resolving service");

        loop {
            // Registered before the cache check so no update slips between.
            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if inner.channel.is_closed() {
                return Err(MdkError::ChannelClosed);
            }
            if let Some(node) = inner.choose(service, version) {
                tracing::debug!(service, version, address = %node.address, "Resolved service");
                return Ok(node);
            }

            let request = match in_flight {
                Some(ref mut request) => request,
                None => {
                    let request = inner.request(service, version, attempt).await?;
                    attempt = attempt.saturating_add(1);
                    in_flight.insert(request)
                }
            };

            let wake = tokio::select! {
                biased;
                _ = inner.channel.closed() => return Err(MdkError::ChannelClosed),
                _ = tokio::time::sleep_until(deadline) => return Err(expired()),
                _ = changed.as_mut() => Wake::CacheChanged,
                reply = &mut request.reply, if !request.answered => Wake::Reply(reply.ok()),
                _ = tokio::time::sleep_until(request.retry_at) => Wake::RetryDue,
            };

            // Anything short of the retry time goes back to the cache check
            // and keeps waiting on the same request.
            match wake {
                Wake::Reply(nodes) => {
                    request.answered = true;
                    match nodes {
                        Some(nodes) if !nodes.is_empty() => inner.merge(nodes),
                        _ => tracing::trace!(service, attempt, "No nodes yet"),
                    }
                }
                Wake::CacheChanged => {}
                Wake::RetryDue => in_flight = None,
            }
        }
    }

    /// Reports a successful interaction with `node`, closing its circuit.
    pub fn record_success(&self, node: &Node) {
        if let Some(mut breaker) = self.inner.breakers.get_mut(&node.address) {
            breaker.success();
        }
        self.inner.changed.notify_waiters();
    }

    /// Reports a failed interaction with `node`.
    ///
    /// After `failure_threshold` consecutive failures the node is skipped by
    /// resolution until a success is reported or the retest delay passes.
    pub fn record_failure(&self, node: &Node) {
        let mut breaker = self
            .inner
            .breakers
            .entry(node.address.clone())
            .or_insert_with(|| CircuitBreaker::new(self.inner.breaker_config.clone()));
        breaker.failure();
        if !breaker.available() {
            tracing::warn!(%node, failures = breaker.failures(), "Node circuit opened");
        }
    }

    /// Whether resolution may currently return `node`.
    pub fn is_available(&self, node: &Node) -> bool {
        self.inner.available(node)
    }

    /// Consecutive failures reported for `node` since its last success.
    pub fn failure_count(&self, node: &Node) -> u32 {
        self.inner
            .breakers
            .get(&node.address)
            .map_or(0, |breaker| breaker.failures())
    }

    /// Circuit state of `node`.
    pub fn circuit_state(&self, node: &Node) -> CircuitState {
        self.inner
            .breakers
            .get(&node.address)
            .map_or(CircuitState::Closed, |breaker| breaker.state())
    }

    /// Snapshot of every cached node of `service` in this environment.
    pub fn known_nodes(&self, service: &str) -> Vec<Node> {
        self.inner
            .clusters
            .get(&ClusterKey::new(service, &self.inner.environment))
            .map(|cluster| cluster.nodes.clone())
            .unwrap_or_default()
    }

    /// Number of resolutions currently waiting for an answer.
    pub fn pending(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Drops every waiter and wakes pending resolutions.
    pub(crate) fn shutdown(&self) {
        self.inner.waiters.clear();
        self.inner.changed.notify_waiters();
    }
}

impl ResolverInner {
    fn choose(&self, service: &str, version: &str) -> Option<Node> {
        self.clusters
            .get_mut(&ClusterKey::new(service, &self.environment))?
            .choose(version, |node| self.available(node))
    }

    fn available(&self, node: &Node) -> bool {
        self.breakers
            .get(&node.address)
            .is_none_or(|breaker| breaker.available())
    }

    async fn request(&self, service: &str, version: &str, attempt: u32) -> Result<InFlight<'_>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, reply) = oneshot::channel();
        self.waiters.insert(request_id, tx);
        let guard = WaiterGuard {
            waiters: &self.waiters,
            request_id,
        };

        let request = Message::Resolve {
            request_id,
            service: service.to_string(),
            version: version.to_string(),
            environment: self.environment.clone(),
        };
        match self.channel.send(request).await {
            Ok(()) => {}
            Err(TransportError::ChannelClosed) => return Err(MdkError::ChannelClosed),
            Err(e) => tracing::warn!(service, request_id, "Resolve request not sent: {}", e),
        }

        Ok(InFlight {
            reply,
            answered: false,
            retry_at: Instant::now() + self.backoff.delay(attempt),
            _guard: guard,
        })
    }

    fn merge(&self, nodes: Vec<Node>) {
        for node in nodes {
            self.clusters.entry(ClusterKey::of(&node)).or_default().upsert(node);
        }
        self.changed.notify_waiters();
    }

    fn handle(&self, message: &Message) {
        match message {
            Message::Resolved { request_id, nodes } => {
                match self.waiters.remove(request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(nodes.clone());
                    }
                    None if !nodes.is_empty() => {
                        tracing::trace!(request_id, "Late resolve answer merged into cache");
                        self.merge(nodes.clone());
                    }
                    None => {}
                }
            }
            Message::NodeActive { node } => {
                tracing::debug!(%node, environment = %node.environment, "Node active");
                self.merge(vec![node.clone()]);
            }
            Message::NodeExpired { node } => {
                tracing::debug!(%node, environment = %node.environment, "Node expired");
                if let Some(mut cluster) = self.clusters.get_mut(&ClusterKey::of(node)) {
                    cluster.nodes.retain(|existing| existing.address != node.address);
                }
                self.changed.notify_waiters();
            }
            Message::ReplaceCluster {
                service,
                environment,
                nodes,
            } => {
                tracing::debug!(service, environment, count = nodes.len(), "Cluster replaced");
                let mut cluster = self
                    .clusters
                    .entry(ClusterKey::new(service, environment))
                    .or_default();
                cluster.nodes = nodes
                    .iter()
                    .filter(|node| node.service == *service)
                    .cloned()
                    .collect();
                drop(cluster);
                self.changed.notify_waiters();
            }
            _ => {}
        }
    }
}
