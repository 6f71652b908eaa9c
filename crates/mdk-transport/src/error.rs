//! Transport error types.

use std::time::Duration;

use mdk_protocol::ProtocolError;
use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection establishment took too long.
    #[error("Connection to {endpoint} timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Endpoint being dialed
        endpoint: String,
        /// The timeout that was exceeded
        timeout: Duration,
    },

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to write a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] ProtocolError),

    /// The channel has been shut down; nothing more will be sent.
    #[error("Transport channel is closed")]
    ChannelClosed,

    /// The outbound queue stayed full for the whole enqueue timeout.
    #[error("Outbound queue full ({capacity} messages)")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Returns `true` when the error means the channel will never send again.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
