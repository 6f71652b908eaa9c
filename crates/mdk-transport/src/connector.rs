//! The seam between the channel and a concrete wire.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::error::{TransportError, TransportResult};

/// Outbound half of a connection: accepts encoded text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection: yields encoded text frames.
///
/// The stream ending, or yielding an error, means the connection is lost.
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<String>> + Send>>;

/// One established connection.
pub struct Connection {
    /// Where frames are written
    pub sink: FrameSink,
    /// Where frames are read
    pub stream: FrameStream,
}

impl Connection {
    /// Boxes a sink/stream pair into a connection.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = TransportResult<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Dials the backend.
///
/// The channel calls [`connect`](Connector::connect) once at startup and again
/// after every lost connection, so implementations must be reusable.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Opens a new connection.
    async fn connect(&self) -> TransportResult<Connection>;

    /// Human readable description of the endpoint, used in logs.
    fn endpoint(&self) -> String;
}
