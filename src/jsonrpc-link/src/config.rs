//! Tunables for sessions, servers and the client pool.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial document
//! (durations in milliseconds) only overrides what it names.
//! [`SessionConfig::from_env`] applies `JSONRPC_LINK_*` overrides on top.

use crate::codec::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 50;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(60);
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run";

const ENV_MAX_IN_FLIGHT: &str = "JSONRPC_LINK_MAX_IN_FLIGHT";
const ENV_MAX_QUEUE: &str = "JSONRPC_LINK_MAX_QUEUE";
const ENV_TIMEOUT_MS: &str = "JSONRPC_LINK_TIMEOUT_MS";

/// Per-session limits and timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Requests written to the transport and still awaiting a response.
    pub max_in_flight: usize,

    /// Accepted but unsent requests; `call` fails with queue-busy beyond it.
    pub max_queue_depth: usize,

    /// Timeout applied when `call` is not given one.
    #[serde(with = "millis")]
    pub default_timeout: Duration,

    /// Period of the flush/timeout sweep.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,

    /// Largest frame payload accepted or produced.
    pub max_message_size: usize,

    /// An idle client older than this counts as expired.
    #[serde(with = "millis")]
    pub idle_expiry: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            default_timeout: DEFAULT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_message_size: MAX_MESSAGE_SIZE,
            idle_expiry: DEFAULT_IDLE_EXPIRY,
        }
    }
}

impl SessionConfig {
    /// Defaults with `JSONRPC_LINK_MAX_IN_FLIGHT`, `JSONRPC_LINK_MAX_QUEUE`
    /// and `JSONRPC_LINK_TIMEOUT_MS` applied when set to positive integers.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize(ENV_MAX_IN_FLIGHT) {
            self.max_in_flight = v;
        }
        if let Some(v) = env_usize(ENV_MAX_QUEUE) {
            self.max_queue_depth = v;
        }
        if let Some(v) = env_usize(ENV_TIMEOUT_MS) {
            self.default_timeout = Duration::from_millis(v as u64);
        }
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_max_queue_depth(mut self, max: usize) -> Self {
        self.max_queue_depth = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_idle_expiry(mut self, expiry: Duration) -> Self {
        self.idle_expiry = expiry;
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

/// Client-side settings: session limits plus addressing and connect timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub session: SessionConfig,

    /// Directory bare service names resolve into
    /// (`<runtime_dir>/<name>-jsonrpc.socket`).
    pub runtime_dir: PathBuf,

    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Server-side settings shared by every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub session: SessionConfig,

    /// Directory bare service names resolve into.
    pub runtime_dir: PathBuf,

    /// Remove an existing socket file at the listen path before binding.
    pub cleanup_stale_socket: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            cleanup_stale_socket: true,
        }
    }
}

impl ServerConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_in_flight, 50);
        assert_eq!(config.max_queue_depth, 100);
        assert_eq!(config.default_timeout, Duration::from_millis(3000));
        assert_eq!(config.sweep_interval, Duration::from_millis(1000));
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.idle_expiry, Duration::from_secs(60));
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config: ClientConfig = serde_json::from_value(json!({
            "max_in_flight": 4,
            "default_timeout": 250,
            "runtime_dir": "/tmp/rpc"
        }))
        .unwrap();

        assert_eq!(config.session.max_in_flight, 4);
        assert_eq!(config.session.default_timeout, Duration::from_millis(250));
        assert_eq!(config.session.max_queue_depth, 100);
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/rpc"));
    }

    #[test]
    fn builders() {
        let config = ServerConfig::default()
            .with_session(SessionConfig::default().with_max_queue_depth(7))
            .with_cleanup_stale_socket(false);
        assert_eq!(config.session.max_queue_depth, 7);
        assert!(!config.cleanup_stale_socket);
    }
}
