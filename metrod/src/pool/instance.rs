//! Running plugin instances.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::plugin::proto::{PluginArgs, PluginHandshake};
use crate::plugin::rpc::PluginRpcClient;
use crate::plugin::{LoadedPlugin, PluginId};
use crate::{Error, Result};

/// Health of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Unhealthy,
    Draining,
    Stopped,
}

/// A live child process of a loaded plugin.
///
/// Instances are checked out of the pool exclusively; the rpc channel
/// itself is still serialized so the health monitor can ping an idle
/// instance without racing a checkout.
pub struct RunningInstance {
    pub instance_id: u32,
    pub plugin: PluginId,
    rpc: PluginRpcClient,
    child: tokio::sync::Mutex<Option<Child>>,
    hit_count: AtomicU64,
    last_hit: Mutex<Option<Instant>>,
    last_hit_at: Mutex<Option<DateTime<Utc>>>,
    health: Mutex<HealthState>,
    ping_failures: Mutex<u32>,
}

impl RunningInstance {
    pub fn new(instance_id: u32, plugin: PluginId, child: Option<Child>, rpc: PluginRpcClient) -> Self {
        Self {
            instance_id,
            plugin,
            rpc,
            child: tokio::sync::Mutex::new(child),
            hit_count: AtomicU64::new(0),
            last_hit: Mutex::new(None),
            last_hit_at: Mutex::new(None),
            health: Mutex::new(HealthState::Ready),
            ping_failures: Mutex::new(0),
        }
    }

    pub fn rpc(&self) -> &PluginRpcClient {
        &self.rpc
    }

    pub fn health(&self) -> HealthState {
        *self.health.lock()
    }

    pub fn set_health(&self, state: HealthState) {
        *self.health.lock() = state;
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Monotonic last-hit instant, used for least-recently-used
    /// selection.
    pub fn last_hit(&self) -> Option<Instant> {
        *self.last_hit.lock()
    }

    /// Wall-clock last-hit time, surfaced in the plugin listing.
    pub fn last_hit_at(&self) -> Option<DateTime<Utc>> {
        *self.last_hit_at.lock()
    }

    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        *self.last_hit.lock() = Some(Instant::now());
        *self.last_hit_at.lock() = Some(Utc::now());
    }

    /// Record a heartbeat result; returns the consecutive failure count.
    pub fn record_ping(&self, ok: bool) -> u32 {
        let mut failures = self.ping_failures.lock();
        if ok {
            *failures = 0;
        } else {
            *failures += 1;
        }
        *failures
    }

    /// Stop the instance: polite rpc stop, then kill the child.
    pub async fn shutdown(&self, grace: Duration) {
        self.set_health(HealthState::Stopped);
        if let Err(e) = self.rpc.stop(grace).await {
            debug!(instance = self.instance_id, "rpc stop failed: {e}");
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(instance = self.instance_id, "failed to kill plugin child: {e}");
            }
        }
    }
}

impl std::fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInstance")
            .field("instance_id", &self.instance_id)
            .field("plugin", &self.plugin)
            .field("health", &self.health())
            .field("hit_count", &self.hit_count())
            .finish()
    }
}

/// Seam for bringing up plugin instances.
///
/// The production launcher spawns the plugin binary; tests substitute a
/// launcher that connects to an in-process stub endpoint.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(
        &self,
        instance_id: u32,
        plugin: &LoadedPlugin,
        args: &PluginArgs,
    ) -> Result<RunningInstance>;
}

/// Spawns the plugin binary and performs the stdout handshake.
pub struct ProcessLauncher {
    pub handshake_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Spawn the binary with the argument blob and read the handshake
    /// line from its stdout.
    pub async fn spawn_process(
        &self,
        path: &std::path::Path,
        args: &PluginArgs,
    ) -> Result<(Child, PluginHandshake)> {
        let blob = serde_json::to_string(args)?;
        let mut child = Command::new(path)
            .arg(blob)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::handshake("plugin stdout unavailable"))?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        let read = tokio::time::timeout(self.handshake_timeout, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => {
                let _ = child.kill().await;
                return Err(Error::handshake("plugin exited before handshake"));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::handshake("timed out waiting for handshake line"));
            }
        }

        let handshake: PluginHandshake = serde_json::from_str(line.trim_end())
            .map_err(|e| Error::handshake(format!("malformed handshake line: {e}")))?;

        if handshake.plugin_token != args.session_token {
            let _ = child.kill().await;
            return Err(Error::handshake("plugin returned a mismatched session token"));
        }

        Ok((child, handshake))
    }
}

#[async_trait]
impl InstanceLauncher for ProcessLauncher {
    async fn launch(
        &self,
        instance_id: u32,
        plugin: &LoadedPlugin,
        args: &PluginArgs,
    ) -> Result<RunningInstance> {
        let (child, handshake) = self.spawn_process(&plugin.path, args).await?;

        if handshake.plugin_type != plugin.id.plugin_type
            || handshake.name != plugin.id.name
            || handshake.version != plugin.id.version
        {
            let _ = self.kill(child).await;
            return Err(Error::handshake(format!(
                "handshake identity {}:{}:v{} does not match loaded plugin {}",
                handshake.plugin_type, handshake.name, handshake.version, plugin.id
            )));
        }

        let rpc = match PluginRpcClient::connect(
            &handshake.rpc_endpoint,
            &args.session_token,
            self.handshake_timeout,
        )
        .await
        {
            Ok(rpc) => rpc,
            Err(e) => {
                let _ = self.kill(child).await;
                return Err(e);
            }
        };

        Ok(RunningInstance::new(
            instance_id,
            plugin.id.clone(),
            Some(child),
            rpc,
        ))
    }
}

impl ProcessLauncher {
    async fn kill(&self, mut child: Child) -> Result<()> {
        child.kill().await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
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

    #[tokio::test]
    async fn test_instance_hit_tracking() {
        let stub = StubPlugin::collector("mock1", 1).spawn().await;
        let rpc = PluginRpcClient::connect(&stub.endpoint(), stub.token(), Duration::from_secs(2))
            .await
            .unwrap();
        let instance = RunningInstance::new(1, loaded("mock1").id, None, rpc);

        assert_eq!(instance.hit_count(), 0);
        assert!(instance.last_hit().is_none());
        instance.record_hit();
        instance.record_hit();
        assert_eq!(instance.hit_count(), 2);
        assert!(instance.last_hit().is_some());
    }

    #[tokio::test]
    async fn test_ping_failure_counter_resets() {
        let stub = StubPlugin::collector("mock1", 1).spawn().await;
        let rpc = PluginRpcClient::connect(&stub.endpoint(), stub.token(), Duration::from_secs(2))
            .await
            .unwrap();
        let instance = RunningInstance::new(1, loaded("mock1").id, None, rpc);

        assert_eq!(instance.record_ping(false), 1);
        assert_eq!(instance.record_ping(false), 2);
        assert_eq!(instance.record_ping(true), 0);
        assert_eq!(instance.record_ping(false), 1);
    }
}
