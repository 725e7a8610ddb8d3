//! Workflow maps.
//!
//! A workflow is a tree rooted at a synthetic collect node: the collect
//! node names the requested metric namespaces (wildcards allowed) with
//! per-prefix config overrides; its children are process or publish
//! nodes, and process nodes may nest further.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::policy::{prefix_matches, ConfigDataNode};
use crate::plugin::{PluginId, PluginType};
use crate::{Error, Result};

/// Requested version for one metric; 0 means latest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(default)]
    pub version: u32,
}

/// A publisher leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishNode {
    pub plugin_name: String,
    /// 0 means latest loaded version at firing time.
    #[serde(default)]
    pub plugin_version: u32,
    #[serde(default, skip_serializing_if = "ConfigDataNode::is_empty")]
    pub config: ConfigDataNode,
}

/// A processor node; may nest further processors and publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_version: u32,
    #[serde(default, skip_serializing_if = "ConfigDataNode::is_empty")]
    pub config: ConfigDataNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process: Vec<ProcessNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish: Vec<PublishNode>,
}

/// The synthetic collect root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectNode {
    /// Requested metric namespaces, possibly wildcarded.
    pub metrics: BTreeMap<String, MetricSpec>,
    /// Config overrides keyed by namespace prefix.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, ConfigDataNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process: Vec<ProcessNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish: Vec<PublishNode>,
}

/// A task's data-flow tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMap {
    pub collect: CollectNode,
}

impl WorkflowMap {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let map: WorkflowMap = serde_json::from_slice(bytes)?;
        map.validate()?;
        Ok(map)
    }

    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        let map: WorkflowMap = serde_yaml::from_slice(bytes)?;
        map.validate()?;
        Ok(map)
    }

    /// Structural validation: at least one metric, well-formed
    /// namespaces, named workflow nodes, and at least one sink so a
    /// firing has somewhere to deliver.
    pub fn validate(&self) -> Result<()> {
        if self.collect.metrics.is_empty() {
            return Err(Error::validation("workflow requests no metrics"));
        }
        for namespace in self.collect.metrics.keys() {
            crate::catalog::tree::split_namespace(namespace)?;
        }
        for node in &self.collect.process {
            validate_process(node)?;
        }
        for node in &self.collect.publish {
            validate_publish(node)?;
        }
        Ok(())
    }

    /// Effective config override for one concrete namespace: prefix
    /// entries merged shallow-to-deep.
    pub fn config_for(&self, namespace: &str) -> ConfigDataNode {
        let mut merged = ConfigDataNode::new();
        for (prefix, table) in &self.collect.config {
            if prefix_matches(prefix, namespace) {
                merged = merged.merged(table);
            }
        }
        merged
    }

    /// Identifiers of every processor and publisher the tree touches.
    ///
    /// Version 0 entries resolve at lookup time; they are reported here
    /// as requested.
    pub fn plugin_refs(&self) -> Vec<PluginId> {
        let mut refs = Vec::new();
        for node in &self.collect.process {
            collect_process_refs(node, &mut refs);
        }
        for node in &self.collect.publish {
            refs.push(PluginId::new(
                PluginType::Publisher,
                node.plugin_name.clone(),
                node.plugin_version,
            ));
        }
        refs.sort();
        refs.dedup();
        refs
    }
}

fn validate_process(node: &ProcessNode) -> Result<()> {
    if node.plugin_name.is_empty() {
        return Err(Error::validation("process node missing plugin name"));
    }
    for child in &node.process {
        validate_process(child)?;
    }
    for child in &node.publish {
        validate_publish(child)?;
    }
    Ok(())
}

fn validate_publish(node: &PublishNode) -> Result<()> {
    if node.plugin_name.is_empty() {
        return Err(Error::validation("publish node missing plugin name"));
    }
    Ok(())
}

fn collect_process_refs(node: &ProcessNode, refs: &mut Vec<PluginId>) {
    refs.push(PluginId::new(
        PluginType::Processor,
        node.plugin_name.clone(),
        node.plugin_version,
    ));
    for child in &node.process {
        collect_process_refs(child, refs);
    }
    for child in &node.publish {
        refs.push(PluginId::new(
            PluginType::Publisher,
            child.plugin_name.clone(),
            child.plugin_version,
        ));
    }
}
