//! The service container.
//!
//! One value owns every collaborator: event bus, metric catalog, pool
//! registry, router, plugin manager, and scheduler. Constructed once at
//! startup and injected into the API layer; nothing in the process is a
//! global.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::catalog::MetricCatalog;
use crate::config::ControlConfig;
use crate::event::EventBus;
use crate::plugin::manager::{generate_args, STATUS_HANDLER_KINDS};
use crate::plugin::PluginManager;
use crate::pool::{PoolRegistry, ProcessLauncher, Router};
use crate::scheduler::Scheduler;
use crate::Result;

/// Owns the control plane's collaborators.
pub struct ServiceContainer {
    pub config: Arc<ControlConfig>,
    pub events: Arc<EventBus>,
    pub catalog: Arc<MetricCatalog>,
    pub pools: Arc<PoolRegistry>,
    pub router: Arc<Router>,
    pub manager: Arc<PluginManager>,
    pub scheduler: Arc<Scheduler>,
    upload_dir: PathBuf,
}

impl ServiceContainer {
    /// Build and wire every service.
    pub fn new(config: ControlConfig) -> Result<Self> {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let catalog = Arc::new(MetricCatalog::new());
        let args = generate_args(&config);

        let launcher = Arc::new(ProcessLauncher::new(config.handshake_timeout()));
        let pools = Arc::new(PoolRegistry::new(
            launcher,
            config.clone(),
            events.clone(),
            args.clone(),
        ));
        let router = Arc::new(Router::new(pools.clone()));
        let manager = Arc::new(PluginManager::new(
            config.clone(),
            catalog.clone(),
            pools.clone(),
            events.clone(),
            args,
        ));
        let scheduler = Arc::new(Scheduler::new(
            catalog.clone(),
            router.clone(),
            manager.clone(),
            events.clone(),
            config.clone(),
        ));

        // Cross-component reactions go through the bus, not through
        // direct references.
        events.register(manager.status_handler(), STATUS_HANDLER_KINDS);
        events.register(scheduler.disabled_handler(), Scheduler::DISABLED_HANDLER_KINDS);

        let upload_dir = match &config.plugin_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!("metrod-plugins-{}", std::process::id())),
        };
        create_private_dir(&upload_dir)?;

        Ok(Self {
            config,
            events,
            catalog,
            pools,
            router,
            manager,
            scheduler,
            upload_dir,
        })
    }

    /// Write an uploaded plugin artifact into a fresh private
    /// subdirectory and return its path.
    pub fn write_upload(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.upload_dir.join(uuid::Uuid::new_v4().to_string());
        create_private_dir(&dir)?;
        let path = dir.join(filename);
        std::fs::write(&path, bytes)?;
        set_private(&path)?;
        Ok(path)
    }

    /// Remove an uploaded artifact's directory after a failed load.
    pub fn discard_upload(&self, path: &Path) {
        if let Some(dir) = path.parent() {
            if dir.starts_with(&self.upload_dir) {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }

    /// Stop tasks and drain every pool.
    pub async fn shutdown(&self) {
        info!("shutting down control plane");
        self.scheduler.shutdown();
        self.pools.shutdown(self.config.drain_grace()).await;
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    set_private(dir)
}

#[cfg(unix)]
fn set_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> Result<()> {
    Ok(())
}
