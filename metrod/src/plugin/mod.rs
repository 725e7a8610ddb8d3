//! Plugin identity and lifecycle.
//!
//! A plugin is an external executable exposing one of three roles. The
//! control plane knows it by the capability set `{identity, config
//! policy, rpc endpoint}`; the role only decides which rpc verbs the
//! instance answers.

pub mod loaded;
pub mod manager;
pub mod proto;
pub mod requested;
pub mod rpc;
pub mod stub;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use loaded::{LoadedPlugin, PluginStatus};
pub use manager::PluginManager;
pub use requested::RequestedPlugin;

/// Plugin role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Collector,
    Processor,
    Publisher,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Collector => write!(f, "collector"),
            PluginType::Processor => write!(f, "processor"),
            PluginType::Publisher => write!(f, "publisher"),
        }
    }
}

impl FromStr for PluginType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collector" => Ok(PluginType::Collector),
            "processor" => Ok(PluginType::Processor),
            "publisher" => Ok(PluginType::Publisher),
            other => Err(crate::Error::validation(format!(
                "invalid plugin type name given {other}"
            ))),
        }
    }
}

/// Globally unique plugin identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId {
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub name: String,
    pub version: u32,
}

impl PluginId {
    pub fn new(plugin_type: PluginType, name: impl Into<String>, version: u32) -> Self {
        Self {
            plugin_type,
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:v{}", self.plugin_type, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_type_parse() {
        assert_eq!("collector".parse::<PluginType>().unwrap(), PluginType::Collector);
        assert_eq!("publisher".parse::<PluginType>().unwrap(), PluginType::Publisher);
        assert!("observer".parse::<PluginType>().is_err());
    }

    #[test]
    fn test_plugin_id_display() {
        let id = PluginId::new(PluginType::Processor, "passthru", 2);
        assert_eq!(id.to_string(), "processor:passthru:v2");
    }
}
