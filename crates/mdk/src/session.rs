//! Sessions: the per-request handle for logging and resolution.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mdk_protocol::{LogEvent, Node, SessionContext, Severity};
use parking_lot::Mutex;

use crate::error::{MdkError, Result};
use crate::runtime::RuntimeInner;

/// A unit of traced work.
///
/// Every event logged through a session carries its trace id, so events from
/// every process that [`join`](crate::Mdk::join)s the same trace can be
/// correlated. Logging never blocks and never fails; problems are reported
/// through `tracing` only.
pub struct Session {
    runtime: Arc<RuntimeInner>,
    context: SessionContext,
    // Nodes resolved within each open interaction, innermost last.
    interactions: Mutex<Vec<Vec<Node>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("trace_id", &self.context.trace_id)
            .field("trace_level", &self.context.trace_level)
            .field("deadline", &self.context.deadline)
            .field("node_id", &self.runtime.node_id)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(runtime: Arc<RuntimeInner>, context: SessionContext) -> Self {
        Self {
            runtime,
            context,
            interactions: Mutex::new(Vec::new()),
        }
    }

    /// Identifier of the trace this session belongs to.
    pub fn trace_id(&self) -> &str {
        &self.context.trace_id
    }

    /// The context that travels with this session.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Logs at [`Severity::Critical`].
    pub fn critical(&self, category: &str, text: impl Into<String>) {
        self.log(Severity::Critical, category, text);
    }

    /// Logs at [`Severity::Error`].
    pub fn error(&self, category: &str, text: impl Into<String>) {
        self.log(Severity::Error, category, text);
    }

    /// Logs at [`Severity::Warn`].
    pub fn warn(&self, category: &str, text: impl Into<String>) {
        self.log(Severity::Warn, category, text);
    }

    /// Logs at [`Severity::Info`].
    pub fn info(&self, category: &str, text: impl Into<String>) {
        self.log(Severity::Info, category, text);
    }

    /// Logs at [`Severity::Debug`].
    pub fn debug(&self, category: &str, text: impl Into<String>) {
        self.log(Severity::Debug, category, text);
    }

    /// Hands an event to the transport outbox and returns immediately.
    pub fn log(&self, severity: Severity, category: &str, text: impl Into<String>) {
        let event = LogEvent::new(
            self.context.trace_id.clone(),
            self.runtime.node_id.clone(),
            severity,
            category,
            text,
        );
        let event_id = event.id.clone();
        if let Err(e) = self.runtime.channel.send_log(event) {
            tracing::warn!(%event_id, %severity, category, "Log event not sent: {}", e);
        }
    }

    /// Sets the trace level carried in this session's context.
    ///
    /// The level is advisory: it travels with [`externalize`](Self::externalize)
    /// for downstream consumers and does not filter what this session emits.
    pub fn trace(&mut self, level: Severity) {
        self.context.trace_level = Some(level);
    }

    /// The trace level, if one was set here or inherited through `join`.
    pub fn trace_level(&self) -> Option<Severity> {
        self.context.trace_level
    }

    /// Limits the whole session to `timeout` from now.
    ///
    /// A deadline only ever moves earlier, including one inherited through
    /// `join`. It travels with [`externalize`](Self::externalize).
    pub fn set_deadline(&mut self, timeout: Duration) {
        self.context.set_deadline(timeout);
    }

    /// Time left before the session deadline, or `None` without one.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.context.remaining()
    }

    /// Encodes the session context for another process to join.
    pub fn externalize(&self) -> Result<String> {
        Ok(self.context.encode()?)
    }

    /// Resolves `service` with a timeout in seconds.
    ///
    /// # Errors
    /// [`MdkError::InvalidArgument`] if `timeout_secs` is not a positive,
    /// finite number; otherwise as [`resolve_within`](Self::resolve_within).
    pub async fn resolve_until(&self, service: &str, version: &str, timeout_secs: f64) -> Result<Node> {
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| {
                MdkError::InvalidArgument(format!(
                    "timeout must be a positive number of seconds, got {timeout_secs}"
                ))
            })?;
        self.resolve_within(service, version, timeout).await
    }

    /// Resolves `service`, giving up after `timeout`.
    ///
    /// Inside an interaction the returned node is recorded so the
    /// interaction's outcome is reported for it.
    pub async fn resolve_within(&self, service: &str, version: &str, timeout: Duration) -> Result<Node> {
        let node = self.runtime.resolver.resolve_until(service, version, timeout).await?;
        if let Some(current) = self.interactions.lock().last_mut() {
            current.push(node.clone());
        }
        Ok(node)
    }

    /// Resolves `service` with the configured default timeout, shortened to
    /// the session deadline.
    ///
    /// # Errors
    /// [`MdkError::ResolutionTimeout`] at once if the deadline has passed;
    /// otherwise as [`resolve_within`](Self::resolve_within).
    pub async fn resolve(&self, service: &str, version: &str) -> Result<Node> {
        let mut timeout = self.runtime.config.default_resolve_timeout;
        if let Some(remaining) = self.remaining_time() {
            if remaining.is_zero() {
                return Err(MdkError::ResolutionTimeout {
                    service: service.to_string(),
                    version: version.to_string(),
                    elapsed: Duration::ZERO,
                });
            }
            timeout = timeout.min(remaining);
        }
        self.resolve_within(service, version, timeout).await
    }

    /// Opens an interaction: every node resolved until the matching
    /// [`finish_interaction`](Self::finish_interaction) is reported as a
    /// success or, after [`fail_interaction`](Self::fail_interaction), a
    /// failure.
    pub fn start_interaction(&self) {
        self.interactions.lock().push(Vec::new());
    }

    /// Reports every node resolved so far in the current interaction as
    /// failed and logs `message` at error severity.
    ///
    /// Nodes resolved afterwards in the same interaction start clean.
    pub fn fail_interaction(&self, message: &str) {
        let suspects = match self.interactions.lock().last_mut() {
            Some(current) => std::mem::take(current),
            None => {
                tracing::debug!(trace_id = %self.context.trace_id, "fail_interaction without an open interaction");
                return;
            }
        };
        for node in &suspects {
            self.runtime.resolver.record_failure(node);
        }
        let involved: Vec<String> = suspects.iter().map(ToString::to_string).collect();
        self.error(
            "interaction failure",
            format!("Interaction failure: {message}; suspected nodes: [{}]", involved.join(", ")),
        );
    }

    /// Closes the current interaction, reporting the nodes it still holds as
    /// successes.
    pub fn finish_interaction(&self) {
        let Some(nodes) = self.interactions.lock().pop() else {
            tracing::debug!(trace_id = %self.context.trace_id, "finish_interaction without an open interaction");
            return;
        };
        for node in &nodes {
            self.runtime.resolver.record_success(node);
        }
    }
}
