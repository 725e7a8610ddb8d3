//! Metric type records.

use serde::{Deserialize, Serialize};

use super::policy::{ConfigDataNode, ConfigPolicy};
use crate::plugin::proto::MetricDeclaration;
use crate::plugin::PluginId;

/// A declared metric at one version, owned by one loaded plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricTypeRecord {
    pub namespace: String,
    pub version: u32,
    /// The collector that declared this metric.
    pub owner: PluginId,
    /// Data type tag declared by the collector.
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Policy applied to subscription configuration.
    #[serde(skip_serializing_if = "ConfigPolicy::is_empty", default)]
    pub policy: ConfigPolicy,
    /// Active subscription count.
    pub subscriptions: u64,
    /// Effective config of the current subscription generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_config: Option<ConfigDataNode>,
}

impl MetricTypeRecord {
    /// Build a record from a discovery declaration.
    pub fn from_declaration(
        declaration: MetricDeclaration,
        owner: PluginId,
        policy: ConfigPolicy,
    ) -> Self {
        Self {
            namespace: declaration.namespace,
            version: declaration.version,
            owner,
            data_type: declaration.data_type,
            unit: declaration.unit,
            description: declaration.description,
            policy,
            subscriptions: 0,
            effective_config: None,
        }
    }
}
