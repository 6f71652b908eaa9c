//! In-process fake backend for tests.
//!
//! [`FakeBackend`] speaks the MDK protocol over in-memory channels. It keeps
//! a registry of nodes, answers `resolve`, broadcasts node changes, acks and
//! republishes logs to subscribed connections, and records every frame it
//! receives. Knobs let tests refuse connections, withhold acks, or drop every
//! connection at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use mdk_protocol::{LogEvent, Message, MessageKind, Node, version_match};
use parking_lot::Mutex;

use crate::connector::{Connection, Connector};
use crate::error::{TransportError, TransportResult};

#[derive(Debug)]
struct Peer {
    tx: mpsc::UnboundedSender<String>,
    subscribed: bool,
}

#[derive(Debug)]
struct BackendState {
    nodes: Vec<Node>,
    peers: HashMap<u64, Peer>,
    next_peer: u64,
    total_connections: usize,
    refuse_connections: bool,
    ack_logs: bool,
    answer_resolves: bool,
    received: Vec<Message>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            peers: HashMap::new(),
            next_peer: 0,
            total_connections: 0,
            refuse_connections: false,
            ack_logs: true,
            answer_resolves: true,
            received: Vec::new(),
        }
    }
}

fn same_node(a: &Node, b: &Node) -> bool {
    a.service == b.service && a.environment == b.environment && a.address == b.address
}

impl BackendState {
    fn send_to(&self, peer: u64, message: &Message) {
        if let (Some(peer), Ok(frame)) = (self.peers.get(&peer), message.encode()) {
            let _ = peer.tx.unbounded_send(frame);
        }
    }

    fn broadcast(&self, message: &Message) {
        if let Ok(frame) = message.encode() {
            self.broadcast_raw(&frame);
        }
    }

    fn broadcast_raw(&self, frame: &str) {
        for peer in self.peers.values() {
            let _ = peer.tx.unbounded_send(frame.to_string());
        }
    }

    fn publish(&self, event: &LogEvent) {
        let Ok(frame) = (Message::Event {
            event: event.clone(),
        })
        .encode() else {
            return;
        };
        for peer in self.peers.values().filter(|peer| peer.subscribed) {
            let _ = peer.tx.unbounded_send(frame.clone());
        }
    }

    fn upsert(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|existing| same_node(existing, &node)) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    fn remove(&mut self, node: &Node) {
        self.nodes.retain(|existing| !same_node(existing, node));
    }
}

/// A scriptable in-memory MDK backend.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    /// Creates an empty backend that accepts connections and acks logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that dials this backend.
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            backend: self.clone(),
        })
    }

    /// Registers a node server side and pushes `node_active` to every client.
    pub fn register(&self, node: Node) {
        let mut state = self.state.lock();
        state.upsert(node.clone());
        state.broadcast(&Message::NodeActive { node });
    }

    /// Removes a node and pushes `node_expired` to every client.
    pub fn expire(&self, node: &Node) {
        let mut state = self.state.lock();
        state.remove(node);
        state.broadcast(&Message::NodeExpired { node: node.clone() });
    }

    /// Replaces a service's cluster and pushes `replace_cluster`.
    pub fn replace_cluster(&self, service: &str, environment: &str, nodes: Vec<Node>) {
        let mut state = self.state.lock();
        state
            .nodes
            .retain(|node| !(node.service == service && node.environment == environment));
        state.nodes.extend(nodes.iter().cloned());
        state.broadcast(&Message::ReplaceCluster {
            service: service.to_string(),
            environment: environment.to_string(),
            nodes,
        });
    }

    /// Pushes a log event to every subscribed connection.
    pub fn publish(&self, event: LogEvent) {
        self.state.lock().publish(&event);
    }

    /// Pushes a raw text frame to every connection.
    pub fn push_raw(&self, frame: impl Into<String>) {
        self.state.lock().broadcast_raw(&frame.into());
    }

    /// Drops every open connection.
    pub fn disconnect_all(&self) {
        self.state.lock().peers.clear();
    }

    /// Makes new connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Controls whether `log` frames are acknowledged.
    pub fn set_ack_logs(&self, ack: bool) {
        self.state.lock().ack_logs = ack;
    }

    /// Controls whether `resolve` requests are answered.
    pub fn set_answer_resolves(&self, answer: bool) {
        self.state.lock().answer_resolves = answer;
    }

    /// Nodes currently registered.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes.clone()
    }

    /// Every frame received, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    /// Frames of one kind received, in arrival order.
    pub fn received_kind(&self, kind: MessageKind) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|message| message.kind() == kind)
            .cloned()
            .collect()
    }

    /// Log events received, including redeliveries.
    pub fn received_logs(&self) -> Vec<LogEvent> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|message| match message {
                Message::Log { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Connections accepted since creation.
    pub fn total_connections(&self) -> usize {
        self.state.lock().total_connections
    }

    fn accept(&self) -> TransportResult<Connection> {
        let (to_client, client_rx) = mpsc::unbounded::<String>();
        let (client_tx, mut from_client) = mpsc::unbounded::<String>();

        let peer = {
            let mut state = self.state.lock();
            if state.refuse_connections {
                return Err(TransportError::ConnectionFailed(
                    "backend refused connection".to_string(),
                ));
            }
            let id = state.next_peer;
            state.next_peer += 1;
            state.total_connections += 1;
            state.peers.insert(
                id,
                Peer {
                    tx: to_client,
                    subscribed: false,
                },
            );
            id
        };

        let backend = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client.next().await {
                backend.handle(peer, &frame);
            }
            backend.state.lock().peers.remove(&peer);
        });

        let sink = client_tx.sink_map_err(|e| TransportError::ConnectionLost(e.to_string()));
        let stream = client_rx.map(Ok::<String, TransportError>);
        Ok(Connection::new(sink, stream))
    }

    fn handle(&self, peer: u64, frame: &str) {
        let Ok(message) = Message::decode(frame) else {
            return;
        };
        let mut state = self.state.lock();
        state.received.push(message.clone());

        match message {
            Message::Resolve {
                request_id,
                service,
                version,
                environment,
            } => {
                if !state.answer_resolves {
                    return;
                }
                let nodes = state
                    .nodes
                    .iter()
                    .filter(|node| {
                        node.service == service
                            && node.environment == environment
                            && version_match(&version, &node.version)
                    })
                    .cloned()
                    .collect();
                state.send_to(peer, &Message::Resolved { request_id, nodes });
            }
            Message::NodeActive { node } => {
                state.upsert(node.clone());
                state.broadcast(&Message::NodeActive { node });
            }
            Message::NodeExpired { node } => {
                state.remove(&node);
                state.broadcast(&Message::NodeExpired { node });
            }
            Message::Log { sequence, event } => {
                if state.ack_logs {
                    state.send_to(peer, &Message::LogAck { sequence });
                }
                state.publish(&event);
            }
            Message::Subscribe => {
                if let Some(peer) = state.peers.get_mut(&peer) {
                    peer.subscribed = true;
                }
            }
            _ => {}
        }
    }
}

/// [`Connector`] that dials a [`FakeBackend`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: FakeBackend,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> TransportResult<Connection> {
        self.backend.accept()
    }

    fn endpoint(&self) -> String {
        "memory://fake-backend".to_string()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
