//! # MDK
//!
//! Client runtime of the microservices development kit: find services by
//! name and version, emit structured log events tagged with a distributed
//! trace, and subscribe to the log stream of every participating process.
//!
//! ## Overview
//!
//! - [`Mdk`] - a running instance; owns one reconnecting backend connection
//! - [`Session`] - a unit of traced work; logs and resolves
//! - [`Resolver`] - discovery cache plus `resolve_until` with jittered retry;
//!   per-node circuit breakers keep failing nodes out of rotation
//! - [`Tracer`] - subscriber bus for inbound log events
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mdk::prelude::*;
//!
//! # async fn example() -> mdk::Result<()> {
//! let mdk = Mdk::start(MdkConfig::from_env()?)?;
//!
//! mdk.tracer()
//!     .subscribe_filtered(EventFilter::new().category("orders"), |event: &LogEvent| {
//!         println!("{} {} {}", event.severity, event.category, event.text);
//!         Flow::Continue
//!     })
//!     .await?;
//!
//! let session = mdk.session();
//! session.info("orders", "looking up inventory");
//! let node = session.resolve_until("inventory", "1.0", 10.0).await?;
//! session.debug("orders", format!("inventory at {}", node.address));
//!
//! mdk.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`MdkConfig::from_env`] reads `MDK_SERVER_URL`, `MDK_ENVIRONMENT` and
//! `MDK_RESOLVE_TIMEOUT_MS`. Tests and embedders can instead supply any
//! [`Connector`](mdk_transport::Connector) through [`MdkBuilder::with_connector`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

mod breaker;
mod config;
mod dedup;
mod error;
pub mod prelude;
mod resolver;
mod runtime;
mod session;
mod tracer;

pub use breaker::{CircuitBreakerConfig, CircuitState};
pub use config::{
    DEFAULT_SERVER_URL, ENVIRONMENT_VAR, MdkConfig, RESOLVE_TIMEOUT_VAR, ResolveBackoff,
    SERVER_URL_VAR,
};
pub use error::{MdkError, Result, SubscriberError};
pub use resolver::Resolver;
pub use runtime::{Mdk, MdkBuilder};
pub use session::Session;
pub use tracer::{EventFilter, Flow, LogSubscriber, SubscriptionHandle, Tracer};

pub use mdk_protocol::{LogEvent, Node, SessionContext, Severity};
pub use mdk_transport::{ChannelConfig, ChannelState, ReconnectConfig};
