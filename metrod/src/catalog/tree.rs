//! Metric namespace trie.
//!
//! Nodes are keyed by path component; each node maps version to a
//! [`MetricTypeRecord`]. Lookups come in two flavors: exact (`get`,
//! wildcards illegal) and query (`fetch`, where `*` matches exactly one
//! component). `**` is not a thing.

use std::collections::BTreeMap;

use super::record::MetricTypeRecord;
use crate::plugin::PluginId;
use crate::{Error, Result};

/// Version argument meaning "latest".
pub const VERSION_LATEST: u32 = 0;

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<String, TrieNode>,
    records: BTreeMap<u32, MetricTypeRecord>,
}

/// The namespace trie. Not internally synchronized; the catalog wraps
/// it in a reader/writer lock.
#[derive(Debug, Default)]
pub struct MetricTrie {
    root: TrieNode,
    len: usize,
}

/// Split `/a/b/c` into components, validating shape.
pub fn split_namespace(namespace: &str) -> Result<Vec<&str>> {
    let trimmed = namespace.strip_prefix('/').ok_or_else(|| {
        Error::validation(format!("namespace must start with '/': {namespace}"))
    })?;
    if trimmed.is_empty() {
        return Err(Error::validation("namespace must not be empty"));
    }
    let components: Vec<&str> = trimmed.split('/').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(Error::validation(format!(
            "namespace has an empty component: {namespace}"
        )));
    }
    Ok(components)
}

/// Whether a namespace contains a wildcard component.
pub fn has_wildcard(namespace: &str) -> bool {
    namespace.split('/').any(|c| c == "*")
}

impl MetricTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a record at `namespace/version`.
    pub fn insert(&mut self, record: MetricTypeRecord) -> Result<()> {
        let components = split_namespace(&record.namespace)?;
        if components.contains(&"*") {
            return Err(Error::validation(format!(
                "wildcard illegal in a declared namespace: {}",
                record.namespace
            )));
        }
        let mut node = &mut self.root;
        for component in components {
            node = node.children.entry(component.to_string()).or_default();
        }
        if node.records.contains_key(&record.version) {
            return Err(Error::MetricAlreadyDeclared {
                namespace: record.namespace.clone(),
                version: record.version,
            });
        }
        node.records.insert(record.version, record);
        self.len += 1;
        Ok(())
    }

    fn node(&self, components: &[&str]) -> Option<&TrieNode> {
        let mut node = &self.root;
        for component in components {
            node = node.children.get(*component)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, components: &[&str]) -> Option<&mut TrieNode> {
        let mut node = &mut self.root;
        for component in components {
            node = node.children.get_mut(*component)?;
        }
        Some(node)
    }

    /// Exact lookup. `version == 0` resolves to the latest version.
    pub fn get(&self, namespace: &str, version: u32) -> Result<&MetricTypeRecord> {
        let components = split_namespace(namespace)?;
        if components.contains(&"*") {
            return Err(Error::validation(format!(
                "wildcard illegal in exact lookup: {namespace}"
            )));
        }
        self.node(&components)
            .and_then(|node| pick_version(&node.records, version))
            .ok_or_else(|| Error::metric_not_found(namespace, version))
    }

    /// Mutable exact lookup, same version semantics as [`get`].
    pub fn get_mut(&mut self, namespace: &str, version: u32) -> Result<&mut MetricTypeRecord> {
        let components = split_namespace(namespace)?;
        let resolved = {
            let node = self
                .node(&components)
                .ok_or_else(|| Error::metric_not_found(namespace, version))?;
            pick_version(&node.records, version)
                .ok_or_else(|| Error::metric_not_found(namespace, version))?
                .version
        };
        let node = self
            .node_mut(&components)
            .ok_or_else(|| Error::metric_not_found(namespace, version))?;
        node.records
            .get_mut(&resolved)
            .ok_or_else(|| Error::metric_not_found(namespace, version))
    }

    /// Wildcard-enabled query.
    ///
    /// `*` matches exactly one component. With `version == 0` the latest
    /// version per matched namespace is returned, otherwise only exact
    /// version matches. Results are ordered lexicographically by full
    /// namespace; an empty result is not an error.
    pub fn fetch(&self, query: &str, version: u32) -> Result<Vec<&MetricTypeRecord>> {
        let components = split_namespace(query)?;
        let mut out = Vec::new();
        collect_matches(&self.root, &components, version, &mut out);
        Ok(out)
    }

    /// Remove every record owned by `owner`; returns the removed
    /// `(namespace, version)` pairs.
    pub fn remove_owner(&mut self, owner: &PluginId) -> Vec<(String, u32)> {
        let mut removed = Vec::new();
        remove_owned(&mut self.root, owner, &mut removed);
        self.len -= removed.len();
        removed
    }

    /// All records, in lexicographic namespace order then ascending
    /// version.
    pub fn records(&self) -> Vec<&MetricTypeRecord> {
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    /// Snapshot table keyed by namespace.
    pub fn table(&self) -> BTreeMap<String, Vec<MetricTypeRecord>> {
        let mut table: BTreeMap<String, Vec<MetricTypeRecord>> = BTreeMap::new();
        for record in self.records() {
            table
                .entry(record.namespace.clone())
                .or_default()
                .push(record.clone());
        }
        table
    }
}

fn pick_version(records: &BTreeMap<u32, MetricTypeRecord>, version: u32) -> Option<&MetricTypeRecord> {
    if version == VERSION_LATEST {
        records.values().next_back()
    } else {
        records.get(&version)
    }
}

fn collect_matches<'a>(
    node: &'a TrieNode,
    components: &[&str],
    version: u32,
    out: &mut Vec<&'a MetricTypeRecord>,
) {
    match components.split_first() {
        None => {
            if version == VERSION_LATEST {
                if let Some(latest) = node.records.values().next_back() {
                    out.push(latest);
                }
            } else if let Some(record) = node.records.get(&version) {
                out.push(record);
            }
        }
        Some((head, rest)) => {
            if *head == "*" {
                for child in node.children.values() {
                    collect_matches(child, rest, version, out);
                }
            } else if let Some(child) = node.children.get(*head) {
                collect_matches(child, rest, version, out);
            }
        }
    }
}

fn walk<'a>(node: &'a TrieNode, out: &mut Vec<&'a MetricTypeRecord>) {
    out.extend(node.records.values());
    for child in node.children.values() {
        walk(child, out);
    }
}

fn remove_owned(node: &mut TrieNode, owner: &PluginId, removed: &mut Vec<(String, u32)>) {
    node.records.retain(|version, record| {
        if &record.owner == owner {
            removed.push((record.namespace.clone(), *version));
            false
        } else {
            true
        }
    });
    for child in node.children.values_mut() {
        remove_owned(child, owner, removed);
    }
    node.children
        .retain(|_, child| !child.records.is_empty() || !child.children.is_empty());
}
