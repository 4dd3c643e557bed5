//! Client configuration.
//!
//! Loaded from a TOML file; every field has a default, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! server_url = "wss://chat.example.com/ws"
//! user_id = "u1"
//! store_path = "parley.redb"
//! keepalive_secs = 25
//! max_send_retries = 3
//! ```

use std::{path::Path, time::Duration};

use chrono::TimeDelta;
use parley_core::{Backoff, ConnectionConfig, backoff, connection, queue};
use parley_sync::{
    EngineConfig,
    reconciler::DEFAULT_OPTIMISTIC_WINDOW_SECS,
    store::MESSAGE_CACHE_CAP,
};
use serde::Deserialize;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {reason}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying error
        reason: String,
    },

    /// File is not valid TOML for [`ClientConfig`]
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// Path that was parsed
        path: String,
        /// Parser message
        reason: String,
    },
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// WebSocket endpoint, without the token
    pub server_url: String,
    /// Signed-in user
    pub user_id: String,
    /// redb cache file; in-memory cache when unset
    pub store_path: Option<String>,
    /// Keepalive ping interval
    pub keepalive_secs: u64,
    /// Time allowed for a pong
    pub pong_timeout_secs: u64,
    /// Time allowed for a connection attempt
    pub connect_timeout_secs: u64,
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Longest reconnect delay
    pub reconnect_cap_secs: u64,
    /// Reconnect attempts before going offline
    pub max_reconnect_attempts: u32,
    /// Randomize reconnect delays
    pub jitter: bool,
    /// Send attempts per queued message
    pub max_send_retries: u32,
    /// Messages kept per conversation in the cache
    pub cache_capacity: usize,
    /// Window for matching an echo without `tempId`, in seconds
    pub optimistic_window_secs: i64,
    /// Default log filter
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000/ws".to_string(),
            user_id: String::new(),
            store_path: None,
            keepalive_secs: connection::DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            pong_timeout_secs: connection::DEFAULT_PONG_TIMEOUT.as_secs(),
            connect_timeout_secs: connection::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            reconnect_base_ms: backoff::DEFAULT_BASE.as_millis() as u64,
            reconnect_cap_secs: backoff::DEFAULT_CAP.as_secs(),
            max_reconnect_attempts: backoff::DEFAULT_MAX_ATTEMPTS,
            jitter: true,
            max_send_retries: queue::DEFAULT_MAX_RETRIES,
            cache_capacity: MESSAGE_CACHE_CAP,
            optimistic_window_secs: DEFAULT_OPTIMISTIC_WINDOW_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io { path: path.display().to_string(), reason: e.to_string() })?;
        Self::parse(&text)
            .map_err(|reason| ConfigError::Parse { path: path.display().to_string(), reason })
    }

    fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            connection: ConnectionConfig {
                endpoint: self.server_url.clone(),
                keepalive_interval: Duration::from_secs(self.keepalive_secs),
                pong_timeout: Duration::from_secs(self.pong_timeout_secs),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                backoff: Backoff {
                    base: Duration::from_millis(self.reconnect_base_ms),
                    cap: Duration::from_secs(self.reconnect_cap_secs),
                    max_attempts: self.max_reconnect_attempts,
                    jitter: self.jitter,
                },
            },
            max_send_retries: self.max_send_retries,
            optimistic_window: TimeDelta::seconds(self.optimistic_window_secs),
            cache_capacity: self.cache_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(ClientConfig::parse("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn engine_config_carries_overrides() {
        let config = ClientConfig::parse(
            r#"
            server_url = "ws://chat.test/ws"
            keepalive_secs = 10
            reconnect_base_ms = 250
            jitter = false
            max_send_retries = 5
            "#,
        )
        .unwrap();

        let engine = config.engine_config();
        assert_eq!(engine.connection.endpoint, "ws://chat.test/ws");
        assert_eq!(engine.connection.keepalive_interval, Duration::from_secs(10));
        assert_eq!(engine.connection.backoff.base, Duration::from_millis(250));
        assert!(!engine.connection.backoff.jitter);
        assert_eq!(engine.max_send_retries, 5);
        assert_eq!(engine.cache_capacity, MESSAGE_CACHE_CAP);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ClientConfig::parse("servr_url = \"x\"").is_err());
    }
}
