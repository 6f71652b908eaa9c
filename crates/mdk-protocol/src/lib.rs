//! # MDK Protocol
//!
//! Wire types shared by every MDK component: resolved service [`Node`]s, log
//! [`LogEvent`]s with their [`Severity`], the [`SessionContext`] that travels
//! between processes, and the [`Message`] envelope exchanged with the
//! discovery and tracing backend.
//!
//! ## Framing
//!
//! Every message is a single JSON text frame tagged by a `"type"` field:
//!
//! ```text
//! {"type":"resolve","request_id":7,"service":"billing","version":"1.0","environment":"sandbox"}
//! {"type":"log","sequence":3,"event":{...}}
//! {"type":"log_ack","sequence":3}
//! ```
//!
//! Frames whose `type` is not known decode to [`ProtocolError::UnknownType`],
//! which receivers treat as "ignore and carry on".
//!
//! ## Usage
//!
//! ```rust
//! use mdk_protocol::{Message, Node};
//!
//! let node = Node::new("billing", "1.2.0", "10.0.0.7:8080");
//! let frame = Message::NodeActive { node }.encode()?;
//! let decoded = Message::decode(&frame)?;
//! assert_eq!(decoded.kind(), mdk_protocol::MessageKind::NodeActive);
//! # Ok::<(), mdk_protocol::ProtocolError>(())
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

mod error;
mod message;
mod types;
mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{Message, MessageKind};
pub use types::{DEFAULT_ENVIRONMENT, LogEvent, Node, SessionContext, Severity};
pub use version::version_match;

/// Protocol revision announced in the `open` frame.
pub const PROTOCOL_VERSION: &str = "2.0";
