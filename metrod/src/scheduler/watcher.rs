//! Per-task watch streams.
//!
//! Each task keeps a bounded ring of recent events; watchers consume at
//! their own pace. A watcher whose cursor falls off the ring gets one
//! terminal `stream-lagged` event and is dropped — the producer is
//! never the one to block.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::plugin::proto::Metric;

/// Default ring capacity per task.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Events visible on a task's watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TaskWatchEvent {
    TaskStarted,
    /// A completed firing with the collected batch.
    MetricEvent { metrics: Vec<Metric> },
    /// A firing skipped because requested metrics resolved to nothing.
    MetricsMissing { namespaces: Vec<String> },
    /// A firing abandoned at the deadline.
    CollectTimeout,
    /// A workflow node failed.
    TaskFailed { message: String },
    TaskStopped,
    TaskDisabled { reason: String },
    TaskEnded,
    /// Terminal event for a watcher that fell behind.
    StreamLagged,
}

/// The producing side of a task's event ring.
#[derive(Debug)]
pub struct TaskWatcher {
    tx: broadcast::Sender<TaskWatchEvent>,
}

impl TaskWatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; a full ring sheds the slowest consumer, never
    /// the producer.
    pub fn publish(&self, event: TaskWatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Attach a new watcher cursor.
    pub fn watch(&self) -> TaskWatch {
        TaskWatch {
            rx: self.tx.subscribe(),
            lagged: false,
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for TaskWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

/// One watcher's cursor over a task's event ring.
#[derive(Debug)]
pub struct TaskWatch {
    rx: broadcast::Receiver<TaskWatchEvent>,
    lagged: bool,
}

impl TaskWatch {
    /// Next event, or `None` once the stream is over. A lagged cursor
    /// yields one final [`TaskWatchEvent::StreamLagged`] and then ends.
    pub async fn next(&mut self) -> Option<TaskWatchEvent> {
        if self.lagged {
            return None;
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                self.lagged = true;
                Some(TaskWatchEvent::StreamLagged)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
