//! Node configuration for a farm peer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NetworkError;
use crate::message::MAX_TTL_HOPS;

/// Configuration for a [`PeerNode`](crate::node::PeerNode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the transport listens on (`host:port` for WebSocket).
    pub listen_addr: String,

    /// Address neighbors should dial to reach us. Required when
    /// `listen_addr` is a wildcard such as `0.0.0.0:9470`.
    pub advertise_addr: Option<String>,

    /// Directory holding the message store, identity and peer list.
    pub data_dir: PathBuf,

    /// Interval between heartbeat rounds to every registry entry.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Retry tick period, also the base of the exponential backoff.
    #[serde(with = "duration_serde")]
    pub retry_interval: Duration,

    /// Upper bound for the backoff between two attempts on one message.
    #[serde(with = "duration_serde")]
    pub backoff_cap: Duration,

    /// Retries allowed after the first relay attempt before giving up.
    pub max_retry_attempts: u32,

    /// Hop budget stamped on locally originated envelopes.
    pub default_ttl_hops: u8,

    /// How long terminal records are kept before the sweep drops them.
    #[serde(with = "duration_serde")]
    pub retention_window: Duration,

    /// Interval between sweep rounds.
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Per-send timeout so one slow peer cannot stall a cycle.
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// How long a DEAD neighbor stays in the registry before it is pruned.
    #[serde(with = "duration_serde")]
    pub dead_peer_grace: Duration,

    /// Addresses to introduce ourselves to on startup.
    pub known_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9470".to_string(),
            advertise_addr: None,
            data_dir: PathBuf::from("farmnet-data"),
            heartbeat_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            max_retry_attempts: 10,
            default_ttl_hops: 5,
            retention_window: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(3),
            dead_peer_grace: Duration::from_secs(600),
            known_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Check values that would make the runtime misbehave.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("retry_interval", self.retry_interval),
            ("sweep_interval", self.sweep_interval),
            ("send_timeout", self.send_timeout),
            ("retention_window", self.retention_window),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(NetworkError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.default_ttl_hops > MAX_TTL_HOPS {
            return Err(NetworkError::Config(format!(
                "default_ttl_hops {} exceeds protocol maximum {MAX_TTL_HOPS}",
                self.default_ttl_hops
            )));
        }
        if self.backoff_cap < self.retry_interval {
            return Err(NetworkError::Config(
                "backoff_cap must not be shorter than retry_interval".to_string(),
            ));
        }
        if let Some(addr) = &self.advertise_addr {
            check_dialable(addr)?;
        }
        Ok(())
    }

    /// The address to put in heartbeats, given where the transport bound.
    ///
    /// Fails when neither `advertise_addr` nor the bound address is
    /// something a neighbor could dial.
    pub fn advertised_addr(&self, bound: &str) -> Result<String, NetworkError> {
        let addr = self.advertise_addr.as_deref().unwrap_or(bound);
        check_dialable(addr)?;
        Ok(addr.to_string())
    }

    /// Delay required after `attempts` sends before the next one is due.
    ///
    /// Doubles from `retry_interval` and saturates at `backoff_cap`.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.retry_interval
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }

    /// Path of the SQLite message store for the given peer.
    pub fn store_path(&self, peer_id: &str) -> PathBuf {
        self.data_dir.join(format!("{peer_id}_messages.db"))
    }

    /// Path of the persisted node identity.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    /// Path of the persisted peer registry for the given peer.
    pub fn registry_path(&self, peer_id: &str) -> PathBuf {
        self.data_dir.join(format!("{peer_id}_peers.json"))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

/// Reject wildcard IPs and port 0. Names that are not socket addresses
/// (hostnames, in-memory endpoints) are taken as given.
fn check_dialable(addr: &str) -> Result<(), NetworkError> {
    let host_port = addr
        .strip_prefix("ws://")
        .or_else(|| addr.strip_prefix("wss://"))
        .unwrap_or(addr);
    if let Ok(socket) = host_port.parse::<SocketAddr>() {
        if socket.ip().is_unspecified() || socket.port() == 0 {
            return Err(NetworkError::Config(format!(
                "{addr} cannot be dialed by neighbors; set advertise_addr to a reachable host:port"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.default_ttl_hops, 5);
        assert_eq!(config.max_retry_attempts, 10);
        assert!(config.known_peers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = NodeConfig {
            retry_interval: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(10),
            ..NodeConfig::default()
        };
        assert_eq!(config.backoff_after(0), Duration::ZERO);
        assert_eq!(config.backoff_after(1), Duration::from_secs(2));
        assert_eq!(config.backoff_after(2), Duration::from_secs(4));
        assert_eq!(config.backoff_after(3), Duration::from_secs(8));
        assert_eq!(config.backoff_after(4), Duration::from_secs(10));
        assert_eq!(config.backoff_after(60), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NodeConfig {
            heartbeat_interval: Duration::ZERO,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));

        let config = NodeConfig {
            default_ttl_hops: MAX_TTL_HOPS + 1,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_listen_needs_advertise_addr() {
        let config = NodeConfig::default();
        assert!(matches!(
            config.advertised_addr("0.0.0.0:9470"),
            Err(NetworkError::Config(_))
        ));
        assert!(config.advertised_addr("[::]:9470").is_err());
        assert_eq!(config.advertised_addr("192.168.1.7:9470").unwrap(), "192.168.1.7:9470");
        assert_eq!(config.advertised_addr("north-field").unwrap(), "north-field");

        let config = NodeConfig {
            advertise_addr: Some("10.0.0.5:9470".to_string()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised_addr("0.0.0.0:9470").unwrap(), "10.0.0.5:9470");

        let config = NodeConfig {
            advertise_addr: Some("ws://0.0.0.0:9470".to_string()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let original = NodeConfig {
            max_retry_attempts: 4,
            known_peers: vec!["192.168.1.100:9470".to_string()],
            ..NodeConfig::default()
        };
        original.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded.max_retry_attempts, 4);
        assert_eq!(loaded.known_peers.len(), 1);
        assert_eq!(loaded.retention_window, original.retention_window);
    }

    #[test]
    fn test_config_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_ttl_hops": 2}"#).unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded.default_ttl_hops, 2);
        assert_eq!(loaded.max_retry_attempts, 10);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_or_default(&dir.path().join("missing.json"));
        assert_eq!(config.default_ttl_hops, 5);
    }
}
