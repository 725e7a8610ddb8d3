//! Process-wide control events.
//!
//! Components coordinate through a synchronous typed event bus: the
//! plugin manager announces loads and unloads, the pools announce
//! disables, and the scheduler announces task lifecycle changes.
//! Handlers run inline on the emitting thread and must not block; a
//! handler that needs async work enqueues it internally. A failing
//! handler never prevents delivery to the others.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::plugin::PluginId;

/// Events emitted on the control bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlEvent {
    PluginLoaded {
        plugin: PluginId,
        timestamp: DateTime<Utc>,
    },
    PluginUnloaded {
        plugin: PluginId,
        timestamp: DateTime<Utc>,
    },
    PluginDisabled {
        plugin: PluginId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    MetricSubscribed {
        namespace: String,
        version: u32,
    },
    MetricUnsubscribed {
        namespace: String,
        version: u32,
    },
    TaskStarted {
        task_id: String,
    },
    TaskStopped {
        task_id: String,
    },
    TaskDisabled {
        task_id: String,
        reason: String,
    },
    MetricCollected {
        task_id: String,
        metric_count: usize,
    },
    /// Meta-event raised when a registered handler returns an error.
    HandlerFailed {
        handler: String,
        message: String,
    },
}

impl ControlEvent {
    /// The kind discriminant used for handler filtering.
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::PluginLoaded { .. } => EventKind::PluginLoaded,
            ControlEvent::PluginUnloaded { .. } => EventKind::PluginUnloaded,
            ControlEvent::PluginDisabled { .. } => EventKind::PluginDisabled,
            ControlEvent::MetricSubscribed { .. } => EventKind::MetricSubscribed,
            ControlEvent::MetricUnsubscribed { .. } => EventKind::MetricUnsubscribed,
            ControlEvent::TaskStarted { .. } => EventKind::TaskStarted,
            ControlEvent::TaskStopped { .. } => EventKind::TaskStopped,
            ControlEvent::TaskDisabled { .. } => EventKind::TaskDisabled,
            ControlEvent::MetricCollected { .. } => EventKind::MetricCollected,
            ControlEvent::HandlerFailed { .. } => EventKind::HandlerFailed,
        }
    }

    /// Short human description, used in log lines.
    pub fn description(&self) -> String {
        match self {
            ControlEvent::PluginLoaded { plugin, .. } => format!("loaded {plugin}"),
            ControlEvent::PluginUnloaded { plugin, .. } => format!("unloaded {plugin}"),
            ControlEvent::PluginDisabled { plugin, reason, .. } => {
                format!("disabled {plugin}: {reason}")
            }
            ControlEvent::MetricSubscribed { namespace, version } => {
                format!("subscribed {namespace} v{version}")
            }
            ControlEvent::MetricUnsubscribed { namespace, version } => {
                format!("unsubscribed {namespace} v{version}")
            }
            ControlEvent::TaskStarted { task_id } => format!("task {task_id} started"),
            ControlEvent::TaskStopped { task_id } => format!("task {task_id} stopped"),
            ControlEvent::TaskDisabled { task_id, reason } => {
                format!("task {task_id} disabled: {reason}")
            }
            ControlEvent::MetricCollected {
                task_id,
                metric_count,
            } => format!("task {task_id} collected {metric_count} metrics"),
            ControlEvent::HandlerFailed { handler, message } => {
                format!("handler {handler} failed: {message}")
            }
        }
    }
}

/// Event kind discriminants for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PluginLoaded,
    PluginUnloaded,
    PluginDisabled,
    MetricSubscribed,
    MetricUnsubscribed,
    TaskStarted,
    TaskStopped,
    TaskDisabled,
    MetricCollected,
    HandlerFailed,
}

/// A registered event handler.
///
/// `handle` runs on the emitting thread; implementations must not
/// block. Returning an error surfaces a [`ControlEvent::HandlerFailed`]
/// meta-event without affecting other handlers.
pub trait EventHandler: Send + Sync {
    /// Name used in `HandlerFailed` events and log lines.
    fn name(&self) -> &str;

    fn handle(&self, event: &ControlEvent) -> Result<(), String>;
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    /// Empty means all kinds.
    kinds: Vec<EventKind>,
}

/// Synchronous typed event bus with an async broadcast tap.
///
/// Emission is ordered per producer. Handlers run inline; async
/// consumers subscribe to the broadcast side instead.
pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
    tap: broadcast::Sender<ControlEvent>,
}

/// Broadcast tap capacity.
const TAP_CAPACITY: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            tap,
        }
    }

    /// Register a handler for the given kinds; an empty slice means all.
    pub fn register(&self, handler: Arc<dyn EventHandler>, kinds: &[EventKind]) {
        self.handlers.write().push(Registration {
            handler,
            kinds: kinds.to_vec(),
        });
    }

    /// Subscribe to the broadcast tap for async consumption.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tap.subscribe()
    }

    /// Emit an event to every matching handler.
    pub fn emit(&self, event: ControlEvent) {
        tracing::debug!(event = %event.description(), "control event");
        let failures = self.dispatch(&event);
        let _ = self.tap.send(event);

        // Handler failures fan out as meta-events. Failures raised while
        // delivering HandlerFailed itself are only logged.
        for (handler, message) in failures {
            let meta = ControlEvent::HandlerFailed { handler, message };
            for (h, m) in self.dispatch(&meta) {
                warn!(handler = %h, error = %m, "handler failed while handling HandlerFailed");
            }
            let _ = self.tap.send(meta);
        }
    }

    fn dispatch(&self, event: &ControlEvent) -> Vec<(String, String)> {
        let kind = event.kind();
        let handlers = self.handlers.read();
        let mut failures = Vec::new();
        for reg in handlers.iter() {
            if !reg.kinds.is_empty() && !reg.kinds.contains(&kind) {
                continue;
            }
            if let Err(message) = reg.handler.handle(event) {
                warn!(handler = %reg.handler.name(), error = %message, "event handler failed");
                failures.push((reg.handler.name().to_string(), message));
            }
        }
        failures
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: String,
        seen: AtomicUsize,
        fail: bool,
    }

    impl EventHandler for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&self, _event: &ControlEvent) -> Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn counting(name: &str, fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            name: name.to_string(),
            seen: AtomicUsize::new(0),
            fail,
        })
    }

    fn task_started() -> ControlEvent {
        ControlEvent::TaskStarted {
            task_id: "t1".to_string(),
        }
    }

    #[test]
    fn test_emit_reaches_all_handlers() {
        let bus = EventBus::new();
        let a = counting("a", false);
        let b = counting("b", false);
        bus.register(a.clone(), &[]);
        bus.register(b.clone(), &[EventKind::TaskStarted]);

        bus.emit(task_started());

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_filter() {
        let bus = EventBus::new();
        let only_stops = counting("stops", false);
        bus.register(only_stops.clone(), &[EventKind::TaskStopped]);

        bus.emit(task_started());
        assert_eq!(only_stops.seen.load(Ordering::SeqCst), 0);

        bus.emit(ControlEvent::TaskStopped {
            task_id: "t1".to_string(),
        });
        assert_eq!(only_stops.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_handler_does_not_block_others() {
        let bus = EventBus::new();
        let bad = counting("bad", true);
        let good = counting("good", false);
        let meta = counting("meta", false);
        bus.register(bad.clone(), &[EventKind::TaskStarted]);
        bus.register(good.clone(), &[EventKind::TaskStarted]);
        bus.register(meta.clone(), &[EventKind::HandlerFailed]);

        bus.emit(task_started());

        assert_eq!(bad.seen.load(Ordering::SeqCst), 1);
        assert_eq!(good.seen.load(Ordering::SeqCst), 1);
        // The failure surfaced as a HandlerFailed meta-event.
        assert_eq!(meta.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_tap() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(task_started());

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ControlEvent::TaskStarted { .. }));
    }
}
