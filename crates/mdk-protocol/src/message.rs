//! The message envelope exchanged with the backend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{LogEvent, Node};

/// Every kind of frame the client sends or understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame on every connection.
    Open {
        /// Protocol revision spoken by the sender.
        version: String,
        /// Process id of the sender.
        node: String,
    },

    /// Ask the backend for nodes of a service.
    Resolve {
        /// Correlates the answer with the waiting caller.
        request_id: u64,
        /// Service name.
        service: String,
        /// Requested version.
        version: String,
        /// Environment to search.
        environment: String,
    },

    /// Answer to [`Message::Resolve`]; `nodes` may be empty.
    Resolved {
        /// Id of the request being answered.
        request_id: u64,
        /// Matching healthy nodes.
        nodes: Vec<Node>,
    },

    /// A node became available (pushed by the backend, or announced by us).
    NodeActive {
        /// The node.
        node: Node,
    },

    /// A node went away.
    NodeExpired {
        /// The node.
        node: Node,
    },

    /// Authoritative replacement of every node of a service.
    ReplaceCluster {
        /// Service name.
        service: String,
        /// Environment of the cluster.
        #[serde(default = "crate::types::default_environment")]
        environment: String,
        /// The new cluster contents.
        nodes: Vec<Node>,
    },

    /// Outbound log event awaiting acknowledgement.
    Log {
        /// Delivery sequence assigned by the sender.
        sequence: u64,
        /// The event.
        event: LogEvent,
    },

    /// Cumulative acknowledgement: every log up to `sequence` arrived.
    LogAck {
        /// Highest sequence received.
        sequence: u64,
    },

    /// Ask the backend to stream log events to this connection.
    Subscribe,

    /// Inbound log event.
    Event {
        /// The event.
        event: LogEvent,
    },

    /// Orderly goodbye.
    Close {
        /// Why the sender is leaving.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Field-less discriminant of [`Message`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`Message::Open`]
    Open,
    /// [`Message::Resolve`]
    Resolve,
    /// [`Message::Resolved`]
    Resolved,
    /// [`Message::NodeActive`]
    NodeActive,
    /// [`Message::NodeExpired`]
    NodeExpired,
    /// [`Message::ReplaceCluster`]
    ReplaceCluster,
    /// [`Message::Log`]
    Log,
    /// [`Message::LogAck`]
    LogAck,
    /// [`Message::Subscribe`]
    Subscribe,
    /// [`Message::Event`]
    Event,
    /// [`Message::Close`]
    Close,
}

impl MessageKind {
    /// Every kind.
    pub const ALL: [MessageKind; 11] = [
        Self::Open,
        Self::Resolve,
        Self::Resolved,
        Self::NodeActive,
        Self::NodeExpired,
        Self::ReplaceCluster,
        Self::Log,
        Self::LogAck,
        Self::Subscribe,
        Self::Event,
        Self::Close,
    ];

    /// Value of the `type` field for this kind.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolve => "resolve",
            Self::Resolved => "resolved",
            Self::NodeActive => "node_active",
            Self::NodeExpired => "node_expired",
            Self::ReplaceCluster => "replace_cluster",
            Self::Log => "log",
            Self::LogAck => "log_ack",
            Self::Subscribe => "subscribe",
            Self::Event => "event",
            Self::Close => "close",
        }
    }

    /// Looks a kind up by its `type` field.
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl Message {
    /// Returns the discriminant of this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Open { .. } => MessageKind::Open,
            Self::Resolve { .. } => MessageKind::Resolve,
            Self::Resolved { .. } => MessageKind::Resolved,
            Self::NodeActive { .. } => MessageKind::NodeActive,
            Self::NodeExpired { .. } => MessageKind::NodeExpired,
            Self::ReplaceCluster { .. } => MessageKind::ReplaceCluster,
            Self::Log { .. } => MessageKind::Log,
            Self::LogAck { .. } => MessageKind::LogAck,
            Self::Subscribe => MessageKind::Subscribe,
            Self::Event { .. } => MessageKind::Event,
            Self::Close { .. } => MessageKind::Close,
        }
    }

    /// Encodes the message as one JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes one JSON text frame.
    ///
    /// The `type` tag is checked before the body so that frames from a newer
    /// backend surface as [`ProtocolError::UnknownType`] rather than as a
    /// generic serialization failure.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        let value: serde_json::Value = serde_json::from_str(frame)?;
        let type_name = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if MessageKind::from_type_name(type_name).is_none() {
            return Err(ProtocolError::UnknownType(type_name.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use pretty_assertions::assert_eq;

    #[test]
    fn kinds_match_serde_tags() {
        let samples = vec![
            Message::Open {
                version: "2.0".into(),
                node: "proc".into(),
            },
            Message::Resolve {
                request_id: 1,
                service: "svc".into(),
                version: "1.0".into(),
                environment: "sandbox".into(),
            },
            Message::Resolved {
                request_id: 1,
                nodes: vec![],
            },
            Message::NodeActive {
                node: Node::new("svc", "1.0", "addr"),
            },
            Message::NodeExpired {
                node: Node::new("svc", "1.0", "addr"),
            },
            Message::ReplaceCluster {
                service: "svc".into(),
                environment: "sandbox".into(),
                nodes: vec![],
            },
            Message::Log {
                sequence: 4,
                event: LogEvent::new("t", "n", Severity::Info, "c", "x"),
            },
            Message::LogAck { sequence: 4 },
            Message::Subscribe,
            Message::Event {
                event: LogEvent::new("t", "n", Severity::Warn, "c", "x"),
            },
            Message::Close { reason: None },
        ];
        assert_eq!(samples.len(), MessageKind::ALL.len());

        for message in samples {
            let frame = message.encode().unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["type"], message.kind().type_name());
            assert_eq!(Message::decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn log_event_uses_level_on_the_wire() {
        let event = LogEvent::new("t", "n", Severity::Error, "c", "boom");
        let frame = Message::Event { event }.encode().unwrap();
        assert!(frame.contains(r#""level":"ERROR""#));
    }

    #[test]
    fn unknown_type_is_reported() {
        assert_eq!(
            Message::decode(r#"{"type":"UnknownMessage"}"#),
            Err(ProtocolError::UnknownType("UnknownMessage".into()))
        );
    }

    #[test]
    fn missing_type_is_reported() {
        assert_eq!(
            Message::decode(r#"{"sequence":1}"#),
            Err(ProtocolError::MissingType)
        );
    }

    #[test]
    fn replace_cluster_defaults_environment() {
        let message =
            Message::decode(r#"{"type":"replace_cluster","service":"svc","nodes":[]}"#).unwrap();
        match message {
            Message::ReplaceCluster { environment, .. } => assert_eq!(environment, "sandbox"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
