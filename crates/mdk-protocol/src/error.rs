//! Protocol error types.

use thiserror::Error;

/// A specialized `Result` type for encoding and decoding.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding MDK frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the expected shape.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The frame carried no `type` field.
    #[error("Frame has no \"type\" field")]
    MissingType,

    /// The frame's `type` is not one this client understands.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// An encoded session context could not be decoded.
    #[error("Invalid session context: {0}")]
    InvalidSessionContext(String),

    /// A severity name could not be parsed.
    #[error("Unknown severity: {0}")]
    UnknownSeverity(String),
}

impl ProtocolError {
    /// Returns `true` for frames that should simply be skipped by a receiver.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
