//! Metric catalog.
//!
//! Single-writer-many-reader registry of declared metrics: a namespace
//! trie behind a reader/writer lock. Reads (resolve, fetch, table) run
//! concurrently; writes (add, remove, subscription mutation) serialize.

pub mod policy;
pub mod record;
pub mod tree;

use std::collections::BTreeMap;

use parking_lot::RwLock;

use policy::ConfigDataNode;
use record::MetricTypeRecord;
use tree::MetricTrie;

use crate::plugin::PluginId;
use crate::Result;

pub use tree::VERSION_LATEST;

/// The process-wide metric catalog.
#[derive(Debug, Default)]
pub struct MetricCatalog {
    trie: RwLock<MetricTrie>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declared metric; rejects `(namespace, version)`
    /// duplicates.
    pub fn add(&self, record: MetricTypeRecord) -> Result<()> {
        self.trie.write().insert(record)
    }

    /// Exact lookup; `version == 0` means latest. Wildcards are illegal
    /// here.
    pub fn get(&self, namespace: &str, version: u32) -> Result<MetricTypeRecord> {
        self.trie.read().get(namespace, version).cloned()
    }

    /// Wildcard query; see [`MetricTrie::fetch`]. Returns owned
    /// snapshots so readers never hold the lock across plugin calls.
    pub fn fetch(&self, query: &str, version: u32) -> Result<Vec<MetricTypeRecord>> {
        Ok(self
            .trie
            .read()
            .fetch(query, version)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Subscribe to a metric, applying its config policy.
    ///
    /// Returns the effective config table and whether this was the
    /// 0 → 1 transition (the caller emits `MetricSubscribed` then).
    pub fn subscribe(
        &self,
        namespace: &str,
        version: u32,
        config: &ConfigDataNode,
    ) -> Result<(ConfigDataNode, bool)> {
        let mut trie = self.trie.write();
        let record = trie.get_mut(namespace, version)?;
        let effective = record
            .policy
            .process(&record.namespace, config)
            .map_err(crate::Error::Policy)?;
        record.subscriptions += 1;
        record.effective_config = Some(effective.clone());
        Ok((effective, record.subscriptions == 1))
    }

    /// Drop one subscription.
    ///
    /// Returns whether this was the 1 → 0 transition. A count that
    /// would go negative is a programming error and aborts the process;
    /// invariants trump availability.
    pub fn unsubscribe(&self, namespace: &str, version: u32) -> Result<bool> {
        let mut trie = self.trie.write();
        let record = trie.get_mut(namespace, version)?;
        if record.subscriptions == 0 {
            panic!(
                "subscription count for {} v{} would go negative",
                record.namespace, record.version
            );
        }
        record.subscriptions -= 1;
        if record.subscriptions == 0 {
            record.effective_config = None;
        }
        Ok(record.subscriptions == 0)
    }

    /// Current subscription count for a concrete metric.
    pub fn subscription_count(&self, namespace: &str, version: u32) -> Result<u64> {
        Ok(self.trie.read().get(namespace, version)?.subscriptions)
    }

    /// Whether any metric owned by `owner` has live subscriptions.
    pub fn owner_in_use(&self, owner: &PluginId) -> bool {
        self.trie
            .read()
            .records()
            .iter()
            .any(|r| &r.owner == owner && r.subscriptions > 0)
    }

    /// Remove every metric owned by `owner`.
    pub fn remove_owner(&self, owner: &PluginId) -> Vec<(String, u32)> {
        self.trie.write().remove_owner(owner)
    }

    /// Snapshot of the whole catalog keyed by namespace.
    pub fn table(&self) -> BTreeMap<String, Vec<MetricTypeRecord>> {
        self.trie.read().table()
    }

    /// All namespaces in lexicographic order, deduplicated.
    pub fn namespaces(&self) -> Vec<String> {
        self.table().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.trie.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}
