//! Available-plugin pools.
//!
//! Per `(type, name, version)` the registry keeps a pool of running
//! instances: least-recently-used selection, lazy spawn up to a cap,
//! FIFO waiters with a per-caller timeout, drain on unload, and a
//! heartbeat that replaces sick instances until a restart budget runs
//! out.

pub mod health;
pub mod instance;
pub mod router;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ControlConfig;
use crate::event::EventBus;
use crate::plugin::proto::PluginArgs;
use crate::plugin::{LoadedPlugin, PluginId};
use crate::{Error, Result};

pub use instance::{HealthState, InstanceLauncher, ProcessLauncher, RunningInstance};
pub use router::Router;

/// Snapshot of one running instance, for the plugin listing.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableInstance {
    pub id: u32,
    #[serde(flatten)]
    pub plugin: PluginId,
    pub hit_count: u64,
    pub last_hit: Option<DateTime<Utc>>,
}

struct PoolState {
    /// Every live instance, checked out or not.
    members: Vec<Arc<RunningInstance>>,
    /// Instances not currently checked out.
    idle: VecDeque<Arc<RunningInstance>>,
    waiters: VecDeque<oneshot::Sender<Arc<RunningInstance>>>,
    /// Spawns in flight, counted against the cap.
    pending: usize,
    restarts_left: u32,
    draining: bool,
    disabled: bool,
}

/// Pool of running instances for one loaded plugin.
pub struct PluginPool {
    plugin: LoadedPlugin,
    args: PluginArgs,
    launcher: Arc<dyn InstanceLauncher>,
    max_instances: usize,
    wait_timeout: Duration,
    next_instance_id: Arc<AtomicU32>,
    state: Mutex<PoolState>,
    cancel: CancellationToken,
}

impl PluginPool {
    fn new(
        plugin: LoadedPlugin,
        args: PluginArgs,
        launcher: Arc<dyn InstanceLauncher>,
        config: &ControlConfig,
        next_instance_id: Arc<AtomicU32>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin,
            args,
            launcher,
            max_instances: config.pool_max_instances,
            wait_timeout: config.pool_wait_timeout(),
            next_instance_id,
            state: Mutex::new(PoolState {
                members: Vec::new(),
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                pending: 0,
                restarts_left: config.restart_budget,
                draining: false,
                disabled: false,
            }),
            cancel,
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled
    }

    /// Check out an instance: LRU ready instance, lazy spawn below the
    /// cap, otherwise FIFO wait with timeout.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledInstance> {
        enum Plan {
            Got(Arc<RunningInstance>),
            Spawn,
            Wait(oneshot::Receiver<Arc<RunningInstance>>),
        }

        let plan = {
            let mut state = self.state.lock();
            if state.disabled {
                return Err(Error::PluginDisabled(self.plugin.id.clone()));
            }
            if state.draining {
                return Err(Error::RouterNoInstance(self.plugin.id.clone()));
            }
            if let Some(instance) = pop_lru_ready(&mut state.idle) {
                Plan::Got(instance)
            } else if state.members.len() + state.pending < self.max_instances {
                state.pending += 1;
                Plan::Spawn
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Got(instance) => Ok(PooledInstance::new(self.clone(), instance)),
            Plan::Spawn => {
                // The caller's job waits for the spawn.
                let launched = self.launch_new().await;
                let mut state = self.state.lock();
                state.pending -= 1;
                match launched {
                    Ok(instance) => {
                        state.members.push(instance.clone());
                        drop(state);
                        Ok(PooledInstance::new(self.clone(), instance))
                    }
                    Err(e) => Err(e),
                }
            }
            Plan::Wait(rx) => match tokio::time::timeout(self.wait_timeout, rx).await {
                Ok(Ok(instance)) => Ok(PooledInstance::new(self.clone(), instance)),
                Ok(Err(_)) | Err(_) => Err(Error::RouterNoInstance(self.plugin.id.clone())),
            },
        }
    }

    async fn launch_new(&self) -> Result<Arc<RunningInstance>> {
        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let instance = self.launcher.launch(id, &self.plugin, &self.args).await?;
        debug!(plugin = %self.plugin.id, instance = id, "spawned pool instance");
        Ok(Arc::new(instance))
    }

    fn checkin(&self, instance: Arc<RunningInstance>) {
        let mut state = self.state.lock();
        if !state.members.iter().any(|m| Arc::ptr_eq(m, &instance)) {
            // Discarded or removed by the health monitor while out.
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(instance.clone()) {
                Ok(()) => return,
                Err(_) => continue, // caller gave up waiting
            }
        }
        state.idle.push_back(instance);
    }

    fn discard(&self, instance: &Arc<RunningInstance>, grace: Duration) {
        {
            let mut state = self.state.lock();
            state.members.retain(|m| !Arc::ptr_eq(m, instance));
            state.idle.retain(|m| !Arc::ptr_eq(m, instance));
        }
        let instance = instance.clone();
        tokio::spawn(async move {
            instance.shutdown(grace).await;
        });
    }

    /// Idle instances, for the heartbeat loop.
    fn idle_snapshot(&self) -> Vec<Arc<RunningInstance>> {
        self.state.lock().idle.iter().cloned().collect()
    }

    /// Consume one unit of restart budget, if any is left.
    fn try_consume_restart(&self) -> bool {
        let mut state = self.state.lock();
        if state.restarts_left == 0 {
            false
        } else {
            state.restarts_left -= 1;
            true
        }
    }

    fn adopt(&self, instance: Arc<RunningInstance>) {
        let mut state = self.state.lock();
        state.members.push(instance.clone());
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(instance.clone()) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }
        state.idle.push_back(instance);
    }

    /// Mark the pool disabled and hand back every member for shutdown.
    fn disable(&self) -> Vec<Arc<RunningInstance>> {
        let mut state = self.state.lock();
        state.disabled = true;
        state.idle.clear();
        state.waiters.clear();
        std::mem::take(&mut state.members)
    }

    /// Refuse new selections, wait for outstanding calls up to the
    /// grace period, then terminate every instance.
    pub async fn drain(&self, grace: Duration) {
        {
            let mut state = self.state.lock();
            state.draining = true;
            state.waiters.clear();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let outstanding = {
                let state = self.state.lock();
                state.members.len() - state.idle.len()
            };
            if outstanding == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let members = {
            let mut state = self.state.lock();
            state.idle.clear();
            std::mem::take(&mut state.members)
        };
        for instance in members {
            instance.shutdown(Duration::from_millis(250)).await;
        }
        self.cancel.cancel();
        info!(plugin = %self.plugin.id, "pool drained");
    }

    /// Instance snapshots for the plugin listing.
    pub fn instances(&self) -> Vec<AvailableInstance> {
        self.state
            .lock()
            .members
            .iter()
            .map(|instance| AvailableInstance {
                id: instance.instance_id,
                plugin: self.plugin.id.clone(),
                hit_count: instance.hit_count(),
                last_hit: instance.last_hit_at(),
            })
            .collect()
    }
}

/// Pop the least-recently-used ready instance.
fn pop_lru_ready(idle: &mut VecDeque<Arc<RunningInstance>>) -> Option<Arc<RunningInstance>> {
    let position = idle
        .iter()
        .enumerate()
        .filter(|(_, i)| i.health() == HealthState::Ready)
        .min_by_key(|(_, i)| i.last_hit())
        .map(|(pos, _)| pos)?;
    idle.remove(position)
}

/// Exclusive checkout of a pool instance.
///
/// Returns the instance to the pool on drop unless it was reported
/// failed, in which case the instance is discarded and reaped.
pub struct PooledInstance {
    pool: Arc<PluginPool>,
    instance: Arc<RunningInstance>,
    failed: bool,
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance")
            .field("failed", &self.failed)
            .finish()
    }
}

impl PooledInstance {
    fn new(pool: Arc<PluginPool>, instance: Arc<RunningInstance>) -> Self {
        instance.record_hit();
        Self {
            pool,
            instance,
            failed: false,
        }
    }

    pub fn instance(&self) -> &RunningInstance {
        &self.instance
    }

    /// Mark the checked-out instance as failed; it will be discarded
    /// instead of returned.
    pub fn report_failure(&mut self) {
        self.failed = true;
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        if self.failed {
            self.instance.set_health(HealthState::Draining);
            self.pool.discard(&self.instance, Duration::from_millis(250));
        } else {
            self.pool.checkin(self.instance.clone());
        }
    }
}

/// Registry of pools keyed by plugin identity.
pub struct PoolRegistry {
    pools: DashMap<PluginId, Arc<PluginPool>>,
    launcher: Arc<dyn InstanceLauncher>,
    config: Arc<ControlConfig>,
    events: Arc<EventBus>,
    args: PluginArgs,
    next_instance_id: Arc<AtomicU32>,
}

impl PoolRegistry {
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        config: Arc<ControlConfig>,
        events: Arc<EventBus>,
        args: PluginArgs,
    ) -> Self {
        Self {
            pools: DashMap::new(),
            launcher,
            config,
            events,
            args,
            next_instance_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Create (or return) the pool for a loaded plugin and start its
    /// heartbeat.
    pub fn register(&self, plugin: &LoadedPlugin) -> Arc<PluginPool> {
        if let Some(existing) = self.pools.get(&plugin.id) {
            return existing.clone();
        }
        let pool = Arc::new(PluginPool::new(
            plugin.clone(),
            self.args.clone(),
            self.launcher.clone(),
            &self.config,
            self.next_instance_id.clone(),
            CancellationToken::new(),
        ));
        self.pools.insert(plugin.id.clone(), pool.clone());
        health::spawn_heartbeat(pool.clone(), self.config.clone(), self.events.clone());
        pool
    }

    pub fn get(&self, id: &PluginId) -> Option<Arc<PluginPool>> {
        self.pools.get(id).map(|p| p.clone())
    }

    /// Check out an instance from the pool for `id`.
    pub async fn checkout(&self, id: &PluginId) -> Result<PooledInstance> {
        match self.get(id) {
            Some(pool) => pool.checkout().await,
            None => Err(Error::RouterNoInstance(id.clone())),
        }
    }

    /// Drain and forget the pool for `id`.
    pub async fn remove(&self, id: &PluginId, grace: Duration) {
        if let Some((_, pool)) = self.pools.remove(id) {
            pool.drain(grace).await;
        }
    }

    /// Snapshot every running instance across all pools.
    pub fn available(&self) -> Vec<AvailableInstance> {
        let mut out: Vec<AvailableInstance> = self
            .pools
            .iter()
            .flat_map(|entry| entry.value().instances())
            .collect();
        out.sort_by_key(|i| i.id);
        out
    }

    /// Drain every pool; used on process shutdown.
    pub async fn shutdown(&self, grace: Duration) {
        let ids: Vec<PluginId> = self.pools.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id, grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::instance::testing::StubLauncher;
    use super::*;
    use crate::plugin::stub::StubPlugin;
    use crate::plugin::PluginType;

    fn loaded(name: &str) -> LoadedPlugin {
        LoadedPlugin::new(
            PluginId::new(PluginType::Collector, name, 1),
            "/nonexistent".into(),
            [0; 32],
            false,
        )
    }

    fn args() -> PluginArgs {
        PluginArgs {
            control_public_key: None,
            log_path: "/tmp/metrod-plugin.log".to_string(),
            session_token: "test-token".to_string(),
        }
    }

    fn registry_with(launcher: Arc<dyn InstanceLauncher>, config: ControlConfig) -> PoolRegistry {
        PoolRegistry::new(
            launcher,
            Arc::new(config),
            Arc::new(EventBus::new()),
            args(),
        )
    }

    async fn stub_registry(config: ControlConfig) -> (PoolRegistry, crate::plugin::stub::StubHandle) {
        let stub = StubPlugin::collector("mock1", 1).spawn().await;
        let launcher = Arc::new(StubLauncher::new(vec![(
            stub.endpoint(),
            stub.token().to_string(),
        )]));
        (registry_with(launcher, config), stub)
    }

    #[tokio::test]
    async fn test_checkout_spawns_lazily() {
        let (registry, _stub) = stub_registry(ControlConfig::default()).await;
        let plugin = loaded("mock1");
        let pool = registry.register(&plugin);

        assert!(pool.instances().is_empty());
        let checked = pool.checkout().await.unwrap();
        assert_eq!(pool.instances().len(), 1);
        assert_eq!(checked.instance().hit_count(), 1);
        drop(checked);

        // Second checkout reuses the idle instance.
        let checked = pool.checkout().await.unwrap();
        assert_eq!(pool.instances().len(), 1);
        assert_eq!(checked.instance().hit_count(), 2);
    }

    #[tokio::test]
    async fn test_checkout_waits_fifo_and_times_out() {
        let config = ControlConfig {
            pool_max_instances: 1,
            pool_wait_timeout_ms: 100,
            ..ControlConfig::default()
        };
        let (registry, _stub) = stub_registry(config).await;
        let plugin = loaded("mock1");
        let pool = registry.register(&plugin);

        let held = pool.checkout().await.unwrap();
        // Pool is at max and the instance is out: this waits, then
        // times out.
        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, Error::RouterNoInstance(_)));

        // A waiter gets the instance as soon as it is returned.
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.checkout().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.instance().hit_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_instance_is_discarded() {
        let (registry, _stub) = stub_registry(ControlConfig::default()).await;
        let plugin = loaded("mock1");
        let pool = registry.register(&plugin);

        let mut checked = pool.checkout().await.unwrap();
        checked.report_failure();
        drop(checked);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.instances().is_empty());
    }

    #[tokio::test]
    async fn test_drain_refuses_new_checkouts() {
        let (registry, _stub) = stub_registry(ControlConfig::default()).await;
        let plugin = loaded("mock1");
        let pool = registry.register(&plugin);

        let _ = pool.checkout().await.unwrap();
        pool.drain(Duration::from_millis(200)).await;

        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, Error::RouterNoInstance(_)));
        assert!(pool.instances().is_empty());
    }

    #[tokio::test]
    async fn test_registry_checkout_unknown_plugin() {
        let (registry, _stub) = stub_registry(ControlConfig::default()).await;
        let id = PluginId::new(PluginType::Collector, "ghost", 1);
        let err = registry.checkout(&id).await.unwrap_err();
        assert!(matches!(err, Error::RouterNoInstance(_)));
    }

    #[tokio::test]
    async fn test_lru_selection() {
        let stub = StubPlugin::collector("mock1", 1).spawn().await;
        let launcher = Arc::new(StubLauncher::new(vec![(
            stub.endpoint(),
            stub.token().to_string(),
        )]));
        let config = ControlConfig {
            pool_max_instances: 2,
            ..ControlConfig::default()
        };
        let registry = registry_with(launcher, config);
        let plugin = loaded("mock1");
        let pool = registry.register(&plugin);

        // Bring up two instances.
        let first = pool.checkout().await.unwrap();
        let second = pool.checkout().await.unwrap();
        let first_id = first.instance().instance_id;
        let second_id = second.instance().instance_id;
        assert_ne!(first_id, second_id);

        // Return first, then second: first is now least recently used.
        drop(first);
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(second);

        let next = pool.checkout().await.unwrap();
        assert_eq!(next.instance().instance_id, first_id);
    }
}
