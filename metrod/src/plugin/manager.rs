//! Plugin load, unload, and swap.
//!
//! Loading runs a short-lived discovery probe: the binary is spawned
//! with the control argument blob, prints its handshake line, answers
//! one `Describe` rpc, and is torn down. Only then does the plugin
//! enter the catalog and get a pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use super::loaded::{LoadedPlugin, PluginStatus};
use super::proto::{PluginArgs, PluginDescription};
use super::requested::{hash_bytes, RequestedPlugin};
use super::rpc::PluginRpcClient;
use super::{PluginId, PluginType};
use crate::catalog::record::MetricTypeRecord;
use crate::catalog::MetricCatalog;
use crate::config::ControlConfig;
use crate::event::{ControlEvent, EventBus, EventHandler, EventKind};
use crate::pool::{PoolRegistry, ProcessLauncher};
use crate::{Error, Result};

/// Lookup of loaded plugins by identity.
///
/// The scheduler resolves workflow references through this seam so it
/// never holds the manager itself.
pub trait PluginResolver: Send + Sync {
    /// Resolve `(type, name, version)`; version 0 means the highest
    /// loaded version.
    fn resolve_plugin(
        &self,
        plugin_type: PluginType,
        name: &str,
        version: u32,
    ) -> Result<LoadedPlugin>;
}

/// Signature policy hook.
///
/// The verification scheme itself is deliberately pluggable; the
/// default checks the detached signature against the artifact digest.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, artifact: &[u8], signature: &[u8]) -> Result<()>;
}

/// Default verifier: the detached signature must contain the hex
/// SHA-256 digest of the artifact.
pub struct DigestVerifier;

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, artifact: &[u8], signature: &[u8]) -> Result<()> {
        let digest = hash_bytes(artifact);
        let expected: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let supplied = String::from_utf8_lossy(signature);
        if supplied.trim() == expected {
            Ok(())
        } else {
            Err(Error::Signature(
                "detached signature does not match artifact digest".to_string(),
            ))
        }
    }
}

/// Build the fixed configuration block every plugin receives.
pub fn generate_args(config: &ControlConfig) -> PluginArgs {
    PluginArgs {
        control_public_key: config
            .public_key_path
            .as_ref()
            .map(|p| p.display().to_string()),
        log_path: config.plugin_log_path.display().to_string(),
        session_token: uuid::Uuid::new_v4().to_string(),
    }
}

/// Loads and unloads plugins, keeping the loaded-plugin table.
pub struct PluginManager {
    config: Arc<ControlConfig>,
    catalog: Arc<MetricCatalog>,
    pools: Arc<PoolRegistry>,
    events: Arc<EventBus>,
    loaded: Arc<DashMap<PluginId, LoadedPlugin>>,
    launcher: ProcessLauncher,
    args: PluginArgs,
    verifier: Box<dyn SignatureVerifier>,
}

impl PluginManager {
    pub fn new(
        config: Arc<ControlConfig>,
        catalog: Arc<MetricCatalog>,
        pools: Arc<PoolRegistry>,
        events: Arc<EventBus>,
        args: PluginArgs,
    ) -> Self {
        let launcher = ProcessLauncher::new(config.handshake_timeout());
        Self {
            config,
            catalog,
            pools,
            events,
            loaded: Arc::new(DashMap::new()),
            launcher,
            args,
            verifier: Box::new(DigestVerifier),
        }
    }

    /// The argument blob shared by discovery probes and pool spawns.
    pub fn plugin_args(&self) -> &PluginArgs {
        &self.args
    }

    /// Load a verified plugin artifact.
    pub async fn load(&self, requested: RequestedPlugin) -> Result<LoadedPlugin> {
        // 1. Integrity: the file on disk must still match the request.
        requested.revalidate()?;

        // 2. Signature hook, when the control keypair is present.
        let signed = match requested.signature() {
            Some(signature) => {
                let artifact = std::fs::read(requested.path())?;
                self.verifier.verify(&artifact, signature)?;
                true
            }
            None if self.config.require_signature() => {
                return Err(Error::Signature(
                    "signature required but not supplied".to_string(),
                ));
            }
            None => false,
        };

        // 3. Discovery probe: spawn, read the handshake line.
        let (mut child, handshake) = self
            .launcher
            .spawn_process(requested.path(), &self.args)
            .await?;
        let id = PluginId::new(handshake.plugin_type, handshake.name.clone(), handshake.version);

        // 4. Duplicate identity check.
        if self.loaded.contains_key(&id) {
            let _ = child.kill().await;
            return Err(Error::AlreadyLoaded(id));
        }

        // 5. One Describe rpc, then tear the probe down.
        let description = self.probe_description(&handshake.rpc_endpoint).await;
        let _ = child.kill().await;
        let description = description?;

        // 6. Record, declare metrics, create the pool.
        let plugin = LoadedPlugin::new(
            id.clone(),
            requested.path().to_path_buf(),
            *requested.checksum(),
            signed,
        );
        self.register_description(&plugin, description)?;
        self.loaded.insert(id.clone(), plugin.clone());
        self.pools.register(&plugin);

        info!(plugin = %id, "plugin loaded");
        self.events.emit(ControlEvent::PluginLoaded {
            plugin: id,
            timestamp: Utc::now(),
        });
        Ok(plugin)
    }

    async fn probe_description(&self, endpoint: &str) -> Result<PluginDescription> {
        let timeout = self.config.handshake_timeout();
        let rpc = PluginRpcClient::connect(endpoint, &self.args.session_token, timeout).await?;
        let description = rpc.describe(timeout).await?;
        let _ = rpc.stop(Duration::from_millis(250)).await;
        Ok(description)
    }

    /// Declare every metric from a description, rolling back on error.
    fn register_description(
        &self,
        plugin: &LoadedPlugin,
        description: PluginDescription,
    ) -> Result<()> {
        if plugin.id.plugin_type != PluginType::Collector && !description.metrics.is_empty() {
            return Err(Error::validation(format!(
                "{} plugins cannot declare metrics",
                plugin.id.plugin_type
            )));
        }
        for declaration in description.metrics {
            let record = MetricTypeRecord::from_declaration(
                declaration,
                plugin.id.clone(),
                description.policy.clone(),
            );
            if let Err(e) = self.catalog.add(record) {
                self.catalog.remove_owner(&plugin.id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unload a plugin. Refuses while any of its metrics is subscribed.
    pub async fn unload(&self, id: &PluginId) -> Result<LoadedPlugin> {
        if !self.loaded.contains_key(id) {
            return Err(Error::PluginNotFound(id.clone()));
        }
        if self.catalog.owner_in_use(id) {
            return Err(Error::PluginInUse(id.clone()));
        }

        self.pools.remove(id, self.config.drain_grace()).await;
        self.catalog.remove_owner(id);
        let (_, plugin) = self
            .loaded
            .remove(id)
            .ok_or_else(|| Error::PluginNotFound(id.clone()))?;

        info!(plugin = %id, "plugin unloaded");
        self.events.emit(ControlEvent::PluginUnloaded {
            plugin: id.clone(),
            timestamp: Utc::now(),
        });
        Ok(plugin)
    }

    /// Atomic load-new + unload-old with rollback.
    pub async fn swap(
        &self,
        incoming: RequestedPlugin,
        outgoing: &PluginId,
    ) -> Result<(LoadedPlugin, LoadedPlugin)> {
        let loaded = self.load(incoming).await?;
        match self.unload(outgoing).await {
            Ok(unloaded) => Ok((loaded, unloaded)),
            Err(unload_err) => {
                warn!(plugin = %outgoing, "swap unload failed, rolling back: {unload_err}");
                match self.unload(&loaded.id).await {
                    Ok(_) => Err(unload_err),
                    Err(rollback_err) => Err(Error::SwapRollbackFailed {
                        unload: unload_err.to_string(),
                        rollback: rollback_err.to_string(),
                    }),
                }
            }
        }
    }

    /// Resolve `(type, name, version)` to a loaded plugin; version 0
    /// picks the highest loaded version.
    pub fn resolve(&self, plugin_type: PluginType, name: &str, version: u32) -> Result<LoadedPlugin> {
        if version != 0 {
            let id = PluginId::new(plugin_type, name, version);
            return self
                .loaded
                .get(&id)
                .map(|p| p.clone())
                .ok_or(Error::PluginNotFound(id));
        }
        self.loaded
            .iter()
            .filter(|entry| {
                entry.key().plugin_type == plugin_type && entry.key().name == name
            })
            .max_by_key(|entry| entry.key().version)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::PluginNotFound(PluginId::new(plugin_type, name, version)))
    }

    pub fn get(&self, id: &PluginId) -> Option<LoadedPlugin> {
        self.loaded.get(id).map(|p| p.clone())
    }

    /// Loaded-plugin table, sorted by identity.
    pub fn loaded_plugins(&self) -> Vec<LoadedPlugin> {
        let mut plugins: Vec<LoadedPlugin> =
            self.loaded.iter().map(|entry| entry.value().clone()).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    /// Bus handler that flips a loaded plugin to `disabled` when its
    /// pool exhausts the restart budget.
    pub fn status_handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(StatusHandler {
            loaded: self.loaded.clone(),
        })
    }
}

impl PluginResolver for PluginManager {
    fn resolve_plugin(
        &self,
        plugin_type: PluginType,
        name: &str,
        version: u32,
    ) -> Result<LoadedPlugin> {
        self.resolve(plugin_type, name, version)
    }
}

struct StatusHandler {
    loaded: Arc<DashMap<PluginId, LoadedPlugin>>,
}

impl EventHandler for StatusHandler {
    fn name(&self) -> &str {
        "plugin-status"
    }

    fn handle(&self, event: &ControlEvent) -> std::result::Result<(), String> {
        if let ControlEvent::PluginDisabled { plugin, .. } = event {
            if let Some(mut entry) = self.loaded.get_mut(plugin) {
                entry.status = PluginStatus::Disabled;
            }
        }
        Ok(())
    }
}

/// The kinds `status_handler` should be registered for.
pub const STATUS_HANDLER_KINDS: &[EventKind] = &[EventKind::PluginDisabled];
