#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mdk::{ChannelConfig, Mdk, MdkConfig, ReconnectConfig};
use mdk_protocol::{Message, MessageKind};
use mdk_transport::testing::FakeBackend;
use parking_lot::Mutex;

pub use mdk_transport::testing::eventually;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> MdkConfig {
    MdkConfig::default()
        .with_stop_grace(Duration::from_millis(200))
        .with_channel_config(
            ChannelConfig::default().with_reconnect_config(ReconnectConfig::aggressive()),
        )
}

pub fn start(backend: &FakeBackend) -> Mdk {
    start_with(backend, test_config())
}

pub fn start_with(backend: &FakeBackend, config: MdkConfig) -> Mdk {
    init_tracing();
    Mdk::builder()
        .with_config(config)
        .with_connector(backend.connector())
        .start()
        .expect("runtime starts")
}

/// `resolve` requests the backend received for `service`.
pub fn resolve_requests(backend: &FakeBackend, service: &str) -> usize {
    backend
        .received_kind(MessageKind::Resolve)
        .iter()
        .filter(|message| matches!(message, Message::Resolve { service: s, .. } if s == service))
        .count()
}

/// Shared list a subscriber closure can push into.
pub fn collector<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}
