//! Channel and reconnection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};

/// Configuration for a [`TransportChannel`](crate::TransportChannel).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of the outbound message queue
    pub queue_capacity: usize,

    /// How long `send` waits for room in a full queue before failing
    pub enqueue_timeout: Duration,

    /// Maximum number of unacknowledged log events kept for redelivery
    pub outbox_capacity: usize,

    /// How long shutdown keeps flushing queued messages
    pub shutdown_grace: Duration,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            enqueue_timeout: Duration::from_secs(1),
            outbox_capacity: 4096,
            shutdown_grace: Duration::from_millis(500),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set outbound queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set enqueue timeout
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Set log outbox capacity
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Set shutdown grace window
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set reconnection configuration
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Checks that every capacity is usable.
    pub fn validate(&self) -> TransportResult<()> {
        if self.queue_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "outbox_capacity must be greater than zero".into(),
            ));
        }
        self.reconnect.validate()
    }
}

/// Reconnection configuration
///
/// Reconnection never gives up on its own; the channel keeps trying until it
/// is shut down. Delays grow by `backoff_factor` from `initial_delay` and are
/// capped at `max_delay`, with `jitter_factor` spreading each delay by up to
/// that fraction in either direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,

    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Exponential backoff factor
    pub backoff_factor: f64,

    /// Relative jitter applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Create new reconnection configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable reconnection; the first lost connection closes the channel
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create aggressive reconnection policy
    pub fn aggressive() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_factor: 1.5,
            jitter_factor: 0.1,
        }
    }

    /// Create conservative reconnection policy
    pub fn conservative() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.5,
            jitter_factor: 0.2,
        }
    }

    /// Set whether reconnection is enabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set jitter factor
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);

        let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * self.jitter_factor;
        let capped_ms = (delay_ms * jitter).min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    fn validate(&self) -> TransportResult<()> {
        if self.backoff_factor < 1.0 {
            return Err(TransportError::ConfigurationError(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(TransportError::ConfigurationError(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(TransportError::ConfigurationError(
                "initial_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }
}
