//! # MDK Transport
//!
//! The single persistent connection between an MDK runtime and its backend.
//! Discovery and tracing traffic share one [`TransportChannel`], which owns
//! the connection, reconnects with capped exponential backoff, and routes
//! inbound messages to handlers registered per [`MessageKind`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                TransportChannel task                 │
//! │                                                      │
//! │  loop {                                              │
//! │    connection = connector.connect()  (with backoff)  │
//! │    send Open + announcements + unacked logs          │
//! │    select! {                                         │
//! │      frame   = stream.next()  => dispatch by kind    │
//! │      message = queue.recv()   => sink.send(message)  │
//! │      outbox ready             => sink.send(logs)     │
//! │      shutdown                 => drain, close, exit  │
//! │    }                                                 │
//! │  }                                                   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Only this task touches the connection, so the outbound queue, the
//! acknowledged log outbox and the handler table are the only shared state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mdk_protocol::{Message, MessageKind};
//! use mdk_transport::{ChannelConfig, TransportChannel, WebSocketConnector};
//!
//! # async fn example() -> mdk_transport::TransportResult<()> {
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:52690/ws")?);
//! let channel = TransportChannel::spawn(connector, "my-process", ChannelConfig::default());
//!
//! channel.on_message(MessageKind::Event, Arc::new(|message: &Message| {
//!     println!("inbound: {message:?}");
//! }));
//!
//! channel.send(Message::Subscribe).await?;
//! channel.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

mod channel;
mod config;
mod connector;
mod error;
mod outbox;
#[cfg(feature = "websocket")]
mod websocket;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use channel::{ChannelState, InboundHandler, TransportChannel};
pub use config::{ChannelConfig, ReconnectConfig};
pub use connector::{Connection, Connector, FrameSink, FrameStream};
pub use error::{TransportError, TransportResult};
pub use outbox::OutboxStats;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

pub use mdk_protocol::{Message, MessageKind};
