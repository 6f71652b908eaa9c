//! Runtime configuration.
//!
//! Configuration is read from the environment by [`MdkConfig::from_env`]:
//!
//! - `MDK_SERVER_URL`: backend WebSocket URL (default `wss://mdk.datawire.io/ws`)
//! - `MDK_ENVIRONMENT`: discovery environment (default `sandbox`)
//! - `MDK_RESOLVE_TIMEOUT_MS`: default resolution timeout (default 10000)

use std::time::Duration;

use mdk_protocol::DEFAULT_ENVIRONMENT;
use mdk_transport::ChannelConfig;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::error::{MdkError, Result};

/// Backend URL used when `MDK_SERVER_URL` is not set.
pub const DEFAULT_SERVER_URL: &str = "wss://mdk.datawire.io/ws";

/// Environment variable naming the backend URL.
pub const SERVER_URL_VAR: &str = "MDK_SERVER_URL";

/// Environment variable naming the discovery environment.
pub const ENVIRONMENT_VAR: &str = "MDK_ENVIRONMENT";

/// Environment variable holding the default resolve timeout in milliseconds.
pub const RESOLVE_TIMEOUT_VAR: &str = "MDK_RESOLVE_TIMEOUT_MS";

/// Retry pacing for `resolve_until`.
///
/// Attempt `n` waits a uniformly random time between zero and
/// `min(max_delay, initial_delay * multiplier^n)` ("full jitter"), so many
/// callers waiting on the same service do not retry in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveBackoff {
    /// Upper bound of the first delay
    pub initial_delay: Duration,
    /// Upper bound of every delay
    pub max_delay: Duration,
    /// Growth of the upper bound per attempt
    pub multiplier: f64,
}

impl Default for ResolveBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl ResolveBackoff {
    /// Upper bound of the delay before attempt `attempt` (zero based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let ceiling_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(ceiling_ms.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Randomized delay before attempt `attempt`, never below one millisecond.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.ceiling(attempt)
            .mul_f64(fastrand::f64())
            .max(Duration::from_millis(1))
    }
}

/// Configuration for an [`Mdk`](crate::Mdk) runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdkConfig {
    /// Backend WebSocket URL
    pub server_url: String,

    /// Discovery environment used for registration and resolution
    pub environment: String,

    /// Timeout used by `Session::resolve`
    pub default_resolve_timeout: Duration,

    /// Retry pacing for resolution
    pub resolve_backoff: ResolveBackoff,

    /// How long `stop` waits for queued messages to flush
    pub stop_grace: Duration,

    /// Per subscriber queue capacity
    pub subscriber_queue_capacity: usize,

    /// Number of event ids remembered for duplicate suppression
    pub dedup_capacity: usize,

    /// How long an event id is remembered
    pub dedup_ttl: Duration,

    /// Deadline given to every new session, if any
    #[serde(default)]
    pub default_deadline: Option<Duration>,

    /// Per-node failure tracking used by resolution
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Transport channel settings
    pub channel: ChannelConfig,
}

impl Default for MdkConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            default_resolve_timeout: Duration::from_secs(10),
            resolve_backoff: ResolveBackoff::default(),
            stop_grace: Duration::from_millis(500),
            subscriber_queue_capacity: 1024,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(300),
            default_deadline: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl MdkConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `MDK_SERVER_URL`, `MDK_ENVIRONMENT` and `MDK_RESOLVE_TIMEOUT_MS`.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns [`MdkError::Configuration`] if a variable is set but unusable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(SERVER_URL_VAR) {
            config.server_url = url.trim().to_string();
        }
        if let Some(environment) = lookup(ENVIRONMENT_VAR) {
            let environment = environment.trim();
            if !environment.is_empty() {
                config.environment = environment.to_string();
            }
        }
        if let Some(timeout) = lookup(RESOLVE_TIMEOUT_VAR) {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                MdkError::Configuration(format!(
                    "{RESOLVE_TIMEOUT_VAR} must be a number of milliseconds, got {timeout:?}"
                ))
            })?;
            config.default_resolve_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set backend URL
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set discovery environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set default resolve timeout
    pub fn with_default_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.default_resolve_timeout = timeout;
        self
    }

    /// Set resolve backoff
    pub fn with_resolve_backoff(mut self, backoff: ResolveBackoff) -> Self {
        self.resolve_backoff = backoff;
        self
    }

    /// Set stop grace window
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set per subscriber queue capacity
    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    /// Set the deadline of new sessions
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Set circuit breaker configuration
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Set transport channel configuration
    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Checks that the configuration can start a runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(MdkError::Configuration("server_url must not be empty".into()));
        }
        if self.environment.is_empty() {
            return Err(MdkError::Configuration("environment must not be empty".into()));
        }
        if self.default_resolve_timeout.is_zero() {
            return Err(MdkError::Configuration(
                "default_resolve_timeout must be positive".into(),
            ));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(MdkError::Configuration(
                "subscriber_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(MdkError::Configuration(
                "dedup_capacity must be greater than zero".into(),
            ));
        }
        if self.resolve_backoff.multiplier < 1.0 {
            return Err(MdkError::Configuration(
                "resolve_backoff.multiplier must be at least 1.0".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MdkError::Configuration(
                "circuit_breaker.failure_threshold must be greater than zero".into(),
            ));
        }
        self.channel.validate()?;
        Ok(())
    }
}
