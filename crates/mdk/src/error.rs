//! Error types for the MDK runtime.

use std::time::Duration;

use mdk_protocol::ProtocolError;
use mdk_transport::TransportError;
use thiserror::Error;

/// Result type for MDK operations.
pub type Result<T> = std::result::Result<T, MdkError>;

/// Errors surfaced to MDK callers.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MdkError {
    /// No node of the service became available before the deadline.
    #[error("Timed out resolving {service} {version} after {elapsed:?}")]
    ResolutionTimeout {
        /// Requested service
        service: String,
        /// Requested version
        version: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// The runtime was stopped or its channel closed.
    #[error("MDK runtime is stopped")]
    ChannelClosed,

    /// A caller supplied an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The runtime configuration is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A frame or encoded session could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport failure other than a closed channel.
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl MdkError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResolutionTimeout { .. } | Self::Transport(TransportError::QueueFull { .. })
        )
    }
}

impl From<TransportError> for MdkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChannelClosed => Self::ChannelClosed,
            TransportError::ConfigurationError(message) => Self::Configuration(message),
            other => Self::Transport(other),
        }
    }
}

/// Failure reported by a [`LogSubscriber`](crate::LogSubscriber).
///
/// The subscription that returned it is removed; other subscribers are not
/// affected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SubscriberError {
    message: String,
}

impl SubscriberError {
    /// Creates an error with a description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for SubscriberError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for SubscriberError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_maps_to_channel_closed() {
        assert!(matches!(
            MdkError::from(TransportError::ChannelClosed),
            MdkError::ChannelClosed
        ));
        assert!(matches!(
            MdkError::from(TransportError::ConfigurationError("bad".into())),
            MdkError::Configuration(message) if message == "bad"
        ));
        assert!(matches!(
            MdkError::from(TransportError::SendFailed("x".into())),
            MdkError::Transport(_)
        ));
    }

    #[test]
    fn only_timeouts_and_backpressure_are_retryable() {
        let timeout = MdkError::ResolutionTimeout {
            service: "svc".into(),
            version: "1.0".into(),
            elapsed: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(MdkError::Transport(TransportError::QueueFull { capacity: 1 }).is_retryable());
        assert!(!MdkError::ChannelClosed.is_retryable());
        assert!(!MdkError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn timeout_message_names_the_service() {
        let err = MdkError::ResolutionTimeout {
            service: "billing".into(),
            version: "2.1".into(),
            elapsed: Duration::from_millis(1500),
        };
        let text = err.to_string();
        assert!(text.contains("billing"));
        assert!(text.contains("2.1"));
    }

    #[test]
    fn subscriber_error_keeps_message() {
        let err = SubscriberError::from("disk full");
        assert_eq!(err.message(), "disk full");
        assert_eq!(err.to_string(), "disk full");
    }
}
