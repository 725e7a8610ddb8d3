//! Per-task actor.
//!
//! Every task is owned by exactly one actor: a single loop selecting
//! over {command inbox, fire timer, cancellation}. All state changes
//! happen inside the loop, so transitions are serialized and a firing
//! can never overlap itself; a tick that lands while the previous
//! firing is still running is dropped and counted as a miss.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::schedule::SchedulePoint;
use super::task::{Task, TaskState};
use super::watcher::{TaskWatchEvent, TaskWatcher};
use crate::catalog::tree::has_wildcard;
use crate::catalog::MetricCatalog;
use crate::event::{ControlEvent, EventBus};
use crate::plugin::proto::{Metric, MetricRequest};
use crate::plugin::{PluginId, PluginType};
use crate::pool::router::{ResolvedMetric, Router};
use crate::workflow::{ProcessNode, PublishNode};
use crate::{Error, Result};

/// Inbox capacity per task actor.
pub const TASK_MAILBOX_CAPACITY: usize = 64;

/// Commands posted to a task actor.
#[derive(Debug)]
pub enum TaskCommand {
    Start { reply: oneshot::Sender<Result<()>> },
    Stop { reply: oneshot::Sender<Result<()>> },
    Enable { reply: oneshot::Sender<Result<()>> },
    Snapshot { reply: oneshot::Sender<Task> },
    /// A plugin this task depends on was disabled.
    PluginDisabled { plugin: PluginId, reason: String },
}

/// Handle for posting commands to a task actor.
#[derive(Clone)]
pub struct TaskHandle {
    sender: mpsc::Sender<TaskCommand>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| TaskCommand::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| TaskCommand::Stop { reply }).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.request(|reply| TaskCommand::Enable { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Task> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TaskCommand::Snapshot { reply: tx })
            .await
            .map_err(|_| Error::task_state("Task actor has stopped"))?;
        rx.await.map_err(|_| Error::task_state("Task actor has stopped"))
    }

    /// Non-blocking notification; used from event-bus handlers.
    pub fn notify_plugin_disabled(&self, plugin: PluginId, reason: String) {
        let _ = self
            .sender
            .try_send(TaskCommand::PluginDisabled { plugin, reason });
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> TaskCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| Error::task_state("Task actor has stopped"))?;
        rx.await.map_err(|_| Error::task_state("Task actor has stopped"))?
    }
}

/// What one firing amounted to.
enum FiringOutcome {
    /// Nothing collected: missing metrics or a blown deadline.
    Missed,
    /// Collection failed outright.
    CollectFailed(String),
    /// Collection succeeded; node failures, if any, are listed.
    Completed { batch_len: usize, node_failures: Vec<String> },
}

/// The actor owning one task.
pub struct TaskActor {
    task: Task,
    /// Concrete plugins this task depends on; disabling any of them
    /// disables the task.
    plugin_deps: HashSet<PluginId>,
    /// Requested (possibly version-0) workflow refs resolved to
    /// concrete identities at creation time.
    resolved_refs: HashMap<PluginId, PluginId>,
    inbox: mpsc::Receiver<TaskCommand>,
    catalog: Arc<MetricCatalog>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    watcher: Arc<TaskWatcher>,
    cancel: CancellationToken,
    next_fire: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl TaskActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Task,
        plugin_deps: HashSet<PluginId>,
        resolved_refs: HashMap<PluginId, PluginId>,
        catalog: Arc<MetricCatalog>,
        router: Arc<Router>,
        events: Arc<EventBus>,
        watcher: Arc<TaskWatcher>,
        cancel: CancellationToken,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = mpsc::channel(TASK_MAILBOX_CAPACITY);
        let handle = TaskHandle {
            sender: tx,
            cancel: cancel.clone(),
        };
        let actor = Self {
            task,
            plugin_deps,
            resolved_refs,
            inbox: rx,
            catalog,
            router,
            events,
            watcher,
            cancel,
            next_fire: None,
            consecutive_failures: 0,
        };
        (actor, handle)
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        info!(task = %self.task.id, name = %self.task.name, "task actor starting");
        loop {
            let armed = self.task.state == TaskState::Spinning;
            let timer = Self::fire_timer(if armed { self.next_fire } else { None });
            tokio::select! {
                biased;

                cmd = self.inbox.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }

                _ = timer => {
                    self.fire().await;
                }

                _ = self.cancel.cancelled() => break,
            }
        }
        debug!(task = %self.task.id, "task actor exiting");
    }

    /// A future completing when the next firing is due; pending forever
    /// when the task is not spinning.
    async fn fire_timer(at: Option<DateTime<Utc>>) {
        match at {
            None => std::future::pending().await,
            Some(at) => {
                let now = Utc::now();
                if at > now {
                    let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn handle_command(&mut self, command: TaskCommand) {
        match command {
            TaskCommand::Start { reply } => {
                let _ = reply.send(self.handle_start());
            }
            TaskCommand::Stop { reply } => {
                let _ = reply.send(self.handle_stop());
            }
            TaskCommand::Enable { reply } => {
                let _ = reply.send(self.handle_enable());
            }
            TaskCommand::Snapshot { reply } => {
                let _ = reply.send(self.task.clone());
            }
            TaskCommand::PluginDisabled { plugin, reason } => {
                if self.plugin_deps.contains(&plugin) && self.task.state.is_running() {
                    self.disable(format!("plugin {plugin} disabled: {reason}"));
                }
            }
        }
    }

    fn handle_start(&mut self) -> Result<()> {
        match self.task.state {
            TaskState::Stopped => {
                match self.task.schedule.next_fire(None, Utc::now()) {
                    SchedulePoint::At(at) => {
                        self.task.state = TaskState::Spinning;
                        self.next_fire = Some(at);
                        self.events.emit(ControlEvent::TaskStarted {
                            task_id: self.task.id.clone(),
                        });
                        self.watcher.publish(TaskWatchEvent::TaskStarted);
                        Ok(())
                    }
                    SchedulePoint::Ended => {
                        self.task.state = TaskState::Ended;
                        self.watcher.publish(TaskWatchEvent::TaskEnded);
                        Err(Error::task_state("Task schedule has already ended."))
                    }
                }
            }
            TaskState::Spinning | TaskState::Firing | TaskState::Stopping => {
                Err(Error::task_state("Task is already running."))
            }
            TaskState::Disabled => Err(Error::task_state("Task is disabled.")),
            TaskState::Ended => Err(Error::task_state("Task has ended.")),
        }
    }

    fn handle_stop(&mut self) -> Result<()> {
        match self.task.state {
            TaskState::Stopped => Err(Error::task_state("Task is already stopped.")),
            TaskState::Disabled => Err(Error::task_state("Task is disabled.")),
            TaskState::Ended => Err(Error::task_state("Task has ended.")),
            TaskState::Spinning | TaskState::Firing | TaskState::Stopping => {
                // Commands are handled between firings, so there is
                // nothing in flight to drain.
                self.task.state = TaskState::Stopped;
                self.next_fire = None;
                self.events.emit(ControlEvent::TaskStopped {
                    task_id: self.task.id.clone(),
                });
                self.watcher.publish(TaskWatchEvent::TaskStopped);
                Ok(())
            }
        }
    }

    fn handle_enable(&mut self) -> Result<()> {
        match self.task.state {
            TaskState::Disabled => {
                self.task.state = TaskState::Stopped;
                self.consecutive_failures = 0;
                Ok(())
            }
            _ => Err(Error::task_state("Task is not disabled.")),
        }
    }

    fn disable(&mut self, reason: String) {
        warn!(task = %self.task.id, %reason, "task disabled");
        self.task.state = TaskState::Disabled;
        self.task.last_failure = Some(reason.clone());
        self.next_fire = None;
        self.events.emit(ControlEvent::TaskDisabled {
            task_id: self.task.id.clone(),
            reason: reason.clone(),
        });
        self.watcher.publish(TaskWatchEvent::TaskDisabled { reason });
    }

    async fn fire(&mut self) {
        let fired_at = Utc::now();
        self.task.state = TaskState::Firing;

        match self.execute_firing().await {
            FiringOutcome::Missed => {
                self.task.miss_count += 1;
            }
            FiringOutcome::CollectFailed(message) => {
                self.record_failure(message);
            }
            FiringOutcome::Completed {
                batch_len,
                node_failures,
            } => {
                self.task.hit_count += 1;
                self.task.last_run = Some(fired_at);
                self.events.emit(ControlEvent::MetricCollected {
                    task_id: self.task.id.clone(),
                    metric_count: batch_len,
                });
                if node_failures.is_empty() {
                    self.consecutive_failures = 0;
                } else {
                    self.record_failure(node_failures.join(" -- "));
                }
            }
        }

        if self.task.state != TaskState::Firing {
            // The firing disabled the task.
            return;
        }
        self.task.state = TaskState::Spinning;
        self.reschedule(fired_at);
    }

    fn record_failure(&mut self, message: String) {
        self.task.fail_count += 1;
        self.consecutive_failures += 1;
        self.task.last_failure = Some(message.clone());
        self.watcher.publish(TaskWatchEvent::TaskFailed { message });
        if self.consecutive_failures >= self.task.stop_on_failure {
            self.disable(format!(
                "reached consecutive failure limit of {}",
                self.task.stop_on_failure
            ));
        }
    }

    /// Advance the schedule past `fired_at`, dropping overrun ticks as
    /// misses so at most one firing is ever in flight.
    fn reschedule(&mut self, fired_at: DateTime<Utc>) {
        let mut last = fired_at;
        loop {
            match self.task.schedule.next_fire(Some(last), Utc::now()) {
                SchedulePoint::At(at) if at <= Utc::now() => {
                    self.task.miss_count += 1;
                    last = at;
                }
                SchedulePoint::At(at) => {
                    self.next_fire = Some(at);
                    return;
                }
                SchedulePoint::Ended => {
                    self.task.state = TaskState::Ended;
                    self.next_fire = None;
                    self.watcher.publish(TaskWatchEvent::TaskEnded);
                    self.events.emit(ControlEvent::TaskStopped {
                        task_id: self.task.id.clone(),
                    });
                    return;
                }
            }
        }
    }

    async fn execute_firing(&mut self) -> FiringOutcome {
        // 1. Resolve the collect node against the catalog as of now.
        let (resolved, missing) = self.resolve_metrics();
        if !missing.is_empty() {
            debug!(task = %self.task.id, ?missing, "requested metrics missing");
            self.watcher
                .publish(TaskWatchEvent::MetricsMissing { namespaces: missing });
            return FiringOutcome::Missed;
        }

        // 2. Collect with the task deadline.
        let batch = match self.router.collect(resolved, self.task.deadline()).await {
            Ok(batch) => batch,
            Err(Error::CollectTimeout) => {
                self.watcher.publish(TaskWatchEvent::CollectTimeout);
                return FiringOutcome::Missed;
            }
            Err(e) => return FiringOutcome::CollectFailed(e.to_string()),
        };

        // 3. Walk the workflow tree depth-first.
        let process_nodes = self.task.workflow.collect.process.clone();
        let publish_nodes = self.task.workflow.collect.publish.clone();
        let mut failures = Vec::new();
        for node in &process_nodes {
            self.run_process_node(node, &batch, &mut failures).await;
        }
        for node in &publish_nodes {
            self.run_publish_node(node, &batch, &mut failures).await;
        }

        // 4. Stream the batch to watchers.
        self.watcher.publish(TaskWatchEvent::MetricEvent {
            metrics: batch.clone(),
        });

        FiringOutcome::Completed {
            batch_len: batch.len(),
            node_failures: failures,
        }
    }

    fn resolve_metrics(&self) -> (Vec<ResolvedMetric>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for (query, spec) in &self.task.workflow.collect.metrics {
            let records = if has_wildcard(query) {
                self.catalog.fetch(query, spec.version)
            } else {
                self.catalog.get(query, spec.version).map(|r| vec![r])
            };
            match records {
                Ok(records) if records.is_empty() => missing.push(query.clone()),
                Ok(records) => {
                    for record in records {
                        let config = record.effective_config.clone().unwrap_or_else(|| {
                            self.task.workflow.config_for(&record.namespace)
                        });
                        resolved.push(ResolvedMetric {
                            owner: record.owner.clone(),
                            request: MetricRequest {
                                namespace: record.namespace,
                                version: record.version,
                                config,
                            },
                        });
                    }
                }
                Err(_) => missing.push(query.clone()),
            }
        }
        (resolved, missing)
    }

    fn run_process_node<'a>(
        &'a self,
        node: &'a ProcessNode,
        input: &'a [Metric],
        failures: &'a mut Vec<String>,
    ) -> BoxFuture<'a, ()> {
        async move {
            let requested = PluginId::new(
                PluginType::Processor,
                node.plugin_name.clone(),
                node.plugin_version,
            );
            let Some(target) = self.resolved_refs.get(&requested) else {
                failures.push(format!("processor {} is not resolved", node.plugin_name));
                return;
            };
            match self
                .router
                .process(
                    target,
                    input.to_vec(),
                    node.config.clone(),
                    self.task.deadline(),
                )
                .await
            {
                Ok(output) => {
                    for child in &node.process {
                        self.run_process_node(child, &output, failures).await;
                    }
                    for child in &node.publish {
                        self.run_publish_node(child, &output, failures).await;
                    }
                }
                Err(e) => failures.push(format!("process {}: {e}", node.plugin_name)),
            }
        }
        .boxed()
    }

    async fn run_publish_node(
        &self,
        node: &PublishNode,
        input: &[Metric],
        failures: &mut Vec<String>,
    ) {
        let requested = PluginId::new(
            PluginType::Publisher,
            node.plugin_name.clone(),
            node.plugin_version,
        );
        let Some(target) = self.resolved_refs.get(&requested) else {
            failures.push(format!("publisher {} is not resolved", node.plugin_name));
            return;
        };
        if let Err(e) = self
            .router
            .publish(
                target,
                input.to_vec(),
                node.config.clone(),
                self.task.deadline(),
            )
            .await
        {
            failures.push(format!("publish {}: {e}", node.plugin_name));
        }
    }
}
