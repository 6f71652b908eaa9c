//! Core MDK value types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Environment nodes are registered in when none is configured.
pub const DEFAULT_ENVIRONMENT: &str = "sandbox";

pub(crate) fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

/// A resolved service instance.
///
/// Nodes are plain values: a `Node` handed out by discovery is a copy and is
/// never updated behind the caller's back when the backend later reports a
/// newer version of the same address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Logical service name, e.g. `"billing"`.
    pub service: String,

    /// Version the instance was registered with, e.g. `"1.2.0"`.
    pub version: String,

    /// Where the instance can be reached, e.g. `"10.0.0.7:8080"` or a URL.
    pub address: String,

    /// Deployment environment the node belongs to.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Free-form metadata attached at registration time.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Node {
    /// Creates a node in the default environment with no properties.
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            address: address.into(),
            environment: default_environment(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// A node is usable only when it names a service and has an address.
    pub fn is_complete(&self) -> bool {
        !self.service.is_empty() && !self.address.is_empty()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.service, self.version, self.address)
    }
}

/// Log severity, ordered from least to most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// An operation failed.
    Error,
    /// The process is in trouble.
    Critical,
}

impl Severity {
    /// Every severity, most important first.
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warn,
        Severity::Info,
        Severity::Debug,
    ];

    /// Upper-case wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(ProtocolError::UnknownSeverity(s.to_string())),
        }
    }
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unique identity of this event, used to suppress redeliveries.
    pub id: String,

    /// Trace id of the session that emitted the event.
    pub session: String,

    /// Process id of the runtime that emitted the event.
    pub node: String,

    /// Milliseconds since the Unix epoch at emission.
    pub timestamp: i64,

    /// Application-defined grouping.
    pub category: String,

    /// Severity the event was emitted with.
    #[serde(rename = "level")]
    pub severity: Severity,

    /// Message payload.
    pub text: String,
}

impl LogEvent {
    /// Creates an event stamped with a fresh id and the current time.
    pub fn new(
        session: impl Into<String>,
        node: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session: session.into(),
            node: node.into(),
            timestamp: Utc::now().timestamp_millis(),
            category: category.into(),
            severity,
            text: text.into(),
        }
    }
}

/// The part of a session that crosses process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Identifier shared by every session taking part in the same trace.
    pub trace_id: String,

    /// Advisory minimum severity requested for this trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_level: Option<Severity>,

    /// Absolute deadline in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

impl SessionContext {
    /// Starts a new trace.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            trace_level: None,
            deadline: None,
        }
    }

    /// Sets the deadline to `timeout` from now, unless an earlier deadline
    /// is already set.
    pub fn set_deadline(&mut self, timeout: Duration) {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let candidate = Utc::now().timestamp_millis().saturating_add(timeout_ms);
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(candidate),
            None => candidate,
        });
    }

    /// Time left until the deadline; zero once it has passed, `None` without
    /// a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline?;
        let left = deadline.saturating_sub(Utc::now().timestamp_millis());
        Some(Duration::from_millis(u64::try_from(left).unwrap_or(0)))
    }

    /// Encodes the context for another process to `join`.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a context produced by [`SessionContext::encode`].
    pub fn decode(encoded: &str) -> ProtocolResult<Self> {
        let context: Self = serde_json::from_str(encoded)
            .map_err(|e| ProtocolError::InvalidSessionContext(e.to_string()))?;
        if context.trace_id.is_empty() {
            return Err(ProtocolError::InvalidSessionContext(
                "empty trace id".to_string(),
            ));
        }
        Ok(context)
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
