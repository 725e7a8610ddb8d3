//! Loaded plugin catalog records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PluginId;

/// Status of a loaded plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Loaded,
    Disabled,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Loaded => write!(f, "loaded"),
            PluginStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Immutable catalog entry for a verified plugin artifact.
///
/// The record never holds process state; running instances live in the
/// pool and reference the record by [`PluginId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedPlugin {
    pub id: PluginId,
    /// Where the verified artifact lives on disk.
    pub path: PathBuf,
    /// SHA-256 of the artifact, hex encoded.
    pub checksum: String,
    /// Whether a detached signature was supplied and verified.
    pub signed: bool,
    pub status: PluginStatus,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    pub fn new(id: PluginId, path: PathBuf, checksum: [u8; 32], signed: bool) -> Self {
        Self {
            id,
            path,
            checksum: hex(&checksum),
            signed,
            status: PluginStatus::Loaded,
            loaded_at: Utc::now(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.status == PluginStatus::Disabled
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginType;

    #[test]
    fn test_new_loaded_plugin() {
        let id = PluginId::new(PluginType::Collector, "mock1", 1);
        let lp = LoadedPlugin::new(id.clone(), "/tmp/mock1".into(), [0xab; 32], false);
        assert_eq!(lp.id, id);
        assert_eq!(lp.status, PluginStatus::Loaded);
        assert!(lp.checksum.starts_with("abab"));
        assert_eq!(lp.checksum.len(), 64);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(PluginStatus::Loaded.to_string(), "loaded");
        assert_eq!(PluginStatus::Disabled.to_string(), "disabled");
    }
}
