//! Pool heartbeat and instance replacement.
//!
//! A background loop pings every idle instance on a fixed interval.
//! Three consecutive misses mark an instance unhealthy; the pool
//! replaces it until the restart budget is exhausted, at which point
//! the plugin is disabled and `PluginDisabled` goes out on the bus.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::instance::HealthState;
use super::PluginPool;
use crate::config::ControlConfig;
use crate::event::{ControlEvent, EventBus};

/// Start the heartbeat loop for one pool. The loop stops when the
/// pool's cancellation token fires (drain or process shutdown).
pub fn spawn_heartbeat(
    pool: Arc<PluginPool>,
    config: Arc<ControlConfig>,
    events: Arc<EventBus>,
) -> JoinHandle<()> {
    let cancel = pool.cancel_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            run_sweep(&pool, &config, &events).await;
            if pool.is_disabled() {
                return;
            }
        }
    })
}

async fn run_sweep(pool: &Arc<PluginPool>, config: &ControlConfig, events: &EventBus) {
    for instance in pool.idle_snapshot() {
        let ok = instance
            .rpc()
            .ping(config.heartbeat_interval())
            .await
            .is_ok();
        let misses = instance.record_ping(ok);
        if ok || misses < config.heartbeat_miss_limit {
            continue;
        }

        warn!(
            plugin = %pool.plugin_id(),
            instance = instance.instance_id,
            misses,
            "instance unhealthy"
        );
        instance.set_health(HealthState::Unhealthy);
        pool.discard(&instance, std::time::Duration::from_millis(250));

        if pool.try_consume_restart() {
            match pool.launch_new().await {
                Ok(replacement) => {
                    info!(
                        plugin = %pool.plugin_id(),
                        instance = replacement.instance_id,
                        "replaced unhealthy instance"
                    );
                    pool.adopt(replacement);
                }
                Err(e) => {
                    warn!(plugin = %pool.plugin_id(), "replacement spawn failed: {e}");
                }
            }
        } else {
            let reason = "restart budget exhausted".to_string();
            warn!(plugin = %pool.plugin_id(), "{reason}; disabling plugin");
            let members = pool.disable();
            for member in members {
                member.shutdown(std::time::Duration::from_millis(250)).await;
            }
            events.emit(ControlEvent::PluginDisabled {
                plugin: pool.plugin_id().clone(),
                reason,
                timestamp: Utc::now(),
            });
            return;
        }
    }
}
