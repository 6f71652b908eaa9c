//! Commonly used types.
//!
//! ```rust
//! use mdk::prelude::*;
//! ```

pub use crate::{
    CircuitBreakerConfig, EventFilter, Flow, LogEvent, LogSubscriber, Mdk, MdkBuilder, MdkConfig,
    MdkError, Node, Result, Session, Severity, SubscriberError, SubscriptionHandle, Tracer,
};
