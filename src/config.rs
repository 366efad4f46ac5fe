//! Client Configuration
//!
//! Endpoint, reconnection policy, send gating and heartbeat parameters.
//! Every field has a default; `from_env` overrides individual fields.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Production websocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://dramai.world/api/ws";

/// Heartbeat parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// How long a probe may stay unanswered.
    pub timeout: Duration,
    /// Consecutive misses that count as connection loss.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Apply a partial update, keeping fields the update leaves unset.
    /// Zero durations and a zero miss threshold are rejected with a warning
    /// and the current value is kept.
    pub fn merged(self, update: HeartbeatConfigUpdate) -> Self {
        Self {
            interval: accept("interval", update.interval, self.interval, |d| !d.is_zero()),
            timeout: accept("timeout", update.timeout, self.timeout, |d| !d.is_zero()),
            max_missed: accept("max_missed", update.max_missed, self.max_missed, |n| *n > 0),
        }
    }
}

/// Partial heartbeat configuration for runtime updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatConfigUpdate {
    /// New probe interval.
    pub interval: Option<Duration>,
    /// New probe timeout.
    pub timeout: Option<Duration>,
    /// New miss threshold.
    pub max_missed: Option<u32>,
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket URL of the game backend.
    pub endpoint: String,
    /// Reconnections scheduled after consecutive closes before giving up.
    pub max_reconnect_attempts: u32,
    /// Backoff unit; attempt `k` waits `k * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
    /// How long `send` waits for the socket to open before queueing.
    pub connect_wait_timeout: Duration,
    /// Poll period while waiting for the socket to open.
    pub connect_wait_poll: Duration,
    /// Pending queue cap; the oldest request is dropped on overflow.
    pub pending_capacity: usize,
    /// Delay between the two requests issued by `request_scene_data`.
    pub scene_data_stagger: Duration,
    /// Heartbeat parameters.
    pub heartbeat: HeartbeatConfig,
    /// File backing the session store. In-memory when `None`.
    pub store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            connect_wait_timeout: Duration::from_secs(5),
            connect_wait_poll: Duration::from_millis(100),
            pending_capacity: 1024,
            scene_data_stagger: Duration::from_millis(200),
            heartbeat: HeartbeatConfig::default(),
            store_path: None,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("DRAMA_LINK_ENDPOINT").unwrap_or(defaults.endpoint),
            max_reconnect_attempts: env_parse("DRAMA_LINK_MAX_RECONNECTS")
                .unwrap_or(defaults.max_reconnect_attempts),
            reconnect_base_delay: env_millis("DRAMA_LINK_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect_base_delay),
            connect_wait_timeout: env_millis("DRAMA_LINK_CONNECT_WAIT_MS")
                .unwrap_or(defaults.connect_wait_timeout),
            connect_wait_poll: defaults.connect_wait_poll,
            pending_capacity: env_parse("DRAMA_LINK_PENDING_CAPACITY")
                .unwrap_or(defaults.pending_capacity),
            scene_data_stagger: defaults.scene_data_stagger,
            heartbeat: defaults.heartbeat.merged(HeartbeatConfigUpdate {
                interval: env_millis("DRAMA_LINK_HEARTBEAT_INTERVAL_MS"),
                timeout: env_millis("DRAMA_LINK_HEARTBEAT_TIMEOUT_MS"),
                max_missed: env_parse("DRAMA_LINK_HEARTBEAT_MAX_MISSED"),
            }),
            store_path: std::env::var("DRAMA_LINK_STORE").ok().map(PathBuf::from),
        }
    }

    /// Backoff before reconnection attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay * attempt
    }
}

fn accept<T: Copy + fmt::Debug>(
    field: &str,
    proposed: Option<T>,
    current: T,
    valid: impl Fn(&T) -> bool,
) -> T {
    match proposed {
        Some(value) if valid(&value) => value,
        Some(value) => {
            warn!(field, value = ?value, "ignoring invalid heartbeat setting");
            current
        }
        None => current,
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
