//! Control-plane configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default heartbeat interval between health pings (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Consecutive missed heartbeats before an instance is unhealthy.
pub const DEFAULT_HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Default maximum running instances per loaded plugin.
pub const DEFAULT_POOL_MAX_INSTANCES: usize = 3;

/// Default instance replacements before a plugin is disabled.
pub const DEFAULT_RESTART_BUDGET: u32 = 3;

/// Default wait for a pool instance before giving up (milliseconds).
pub const DEFAULT_POOL_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Default grace period when draining a pool (milliseconds).
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 3_000;

/// Default timeout for the discovery handshake (milliseconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Control-plane configuration.
///
/// Everything has a sensible default so `ControlConfig::default()` is a
/// usable in-process configuration for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Directory where uploaded plugin artifacts are stored.
    ///
    /// When unset, a per-process temp directory is created.
    pub plugin_dir: Option<PathBuf>,
    /// Path to the control-plane public key handed to plugins.
    ///
    /// Presence of the key pair toggles signature verification on load.
    pub public_key_path: Option<PathBuf>,
    /// Log path handed to spawned plugins.
    pub plugin_log_path: PathBuf,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before an instance is unhealthy.
    pub heartbeat_miss_limit: u32,
    /// Maximum running instances per loaded plugin.
    pub pool_max_instances: usize,
    /// Instance replacements allowed before the plugin is disabled.
    pub restart_budget: u32,
    /// How long a caller waits for a pool instance.
    pub pool_wait_timeout_ms: u64,
    /// Grace period for outstanding calls when draining a pool.
    pub drain_grace_ms: u64,
    /// Timeout for the discovery handshake line.
    pub handshake_timeout_ms: u64,
    /// Watcher ring capacity per task.
    pub watcher_ring_capacity: usize,
    /// REST bind address.
    pub api_bind_address: String,
    /// REST port.
    pub api_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            public_key_path: None,
            plugin_log_path: std::env::temp_dir().join("metrod-plugin.log"),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_miss_limit: DEFAULT_HEARTBEAT_MISS_LIMIT,
            pool_max_instances: DEFAULT_POOL_MAX_INSTANCES,
            restart_budget: DEFAULT_RESTART_BUDGET,
            pool_wait_timeout_ms: DEFAULT_POOL_WAIT_TIMEOUT_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            watcher_ring_capacity: crate::scheduler::watcher::DEFAULT_RING_CAPACITY,
            api_bind_address: "0.0.0.0".to_string(),
            api_port: 8181,
        }
    }
}

impl ControlConfig {
    /// Load configuration from a JSON or YAML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
            _ => serde_json::from_str(&raw)?,
        };
        Ok(config)
    }

    /// Whether signature verification is required on plugin load.
    pub fn require_signature(&self) -> bool {
        self.public_key_path.is_some()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_wait_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
