#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use rand::Rng as _;

use crate::types::ClientId;

const DEFAULT_CONNECTION_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_JITTER_DURATION: Duration = Duration::from_millis(500);
const DEFAULT_FLUSH_INTERVAL_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_FLUSH_BATCH_SIZE: usize = 5;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for the task channel.
///
/// ```
/// use std::time::Duration;
///
/// use task_channel_client::ws::config::{Config, ReconnectConfig};
///
/// let mut reconnect = ReconnectConfig::default();
/// reconnect.max_attempts = 3;
///
/// let config = Config::builder()
///     .connection_timeout(Duration::from_secs(5))
///     .reconnect(reconnect)
///     .build();
/// assert_eq!(config.reconnect.max_attempts, 3);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Deadline for the WebSocket handshake before the attempt is abandoned
    #[builder(default = DEFAULT_CONNECTION_TIMEOUT_DURATION)]
    pub connection_timeout: Duration,
    /// Identifier attached to the connection URL; stable for the manager's lifetime
    #[builder(default = ClientId::generate())]
    pub client_id: ClientId,
    /// Liveness probing
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Outbound queue behavior
    #[builder(default)]
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Heartbeat configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval for sending `ping` frames while the connection is open
    pub interval: Duration,
    /// Force-close the transport if no `pong`/`heartbeat` arrives for this long.
    /// `None` only records liveness and never acts on it.
    pub timeout: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: Some(DEFAULT_HEARTBEAT_TIMEOUT_DURATION),
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnection attempts before the backend
    /// is marked unavailable.
    pub max_attempts: u32,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration, before jitter
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound of the random delay added to every backoff
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// Random addition in `[0, max_jitter]` so that many clients do not
    /// reconnect in lockstep.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        let max_millis = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_millis))
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // Jitter is additive and applied separately
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Outbound queue configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often queued messages are flushed while connected
    pub flush_interval: Duration,
    /// Maximum number of messages transmitted per flush cycle
    pub batch_size: usize,
    /// Retry budget for messages sent with default options
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL_DURATION,
            batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}
