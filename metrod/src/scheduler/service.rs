//! Scheduler service.
//!
//! Owns every task actor. Creation resolves and subscribes the
//! workflow's metrics against the catalog; removal unwinds the
//! subscriptions. External callers hold opaque task ids only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::actor::{TaskActor, TaskHandle};
use super::schedule::Schedule;
use super::task::{Task, TaskState};
use super::watcher::{TaskWatch, TaskWatcher};
use crate::catalog::tree::has_wildcard;
use crate::catalog::MetricCatalog;
use crate::config::ControlConfig;
use crate::event::{ControlEvent, EventBus, EventHandler, EventKind};
use crate::plugin::manager::PluginResolver;
use crate::plugin::PluginId;
use crate::pool::Router;
use crate::workflow::WorkflowMap;
use crate::{Error, Result};

/// A task creation request.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub name: Option<String>,
    pub schedule: Schedule,
    pub workflow: WorkflowMap,
    pub deadline: Option<Duration>,
    pub stop_on_failure: Option<u32>,
    /// Start immediately after creation.
    pub start: bool,
}

struct TaskEntry {
    handle: TaskHandle,
    watcher: Arc<TaskWatcher>,
    /// Concrete `(namespace, version)` pairs subscribed at creation.
    subscriptions: Vec<(String, u32)>,
}

/// The scheduler: task registry plus actor supervision.
pub struct Scheduler {
    entries: Arc<DashMap<String, TaskEntry>>,
    catalog: Arc<MetricCatalog>,
    router: Arc<Router>,
    resolver: Arc<dyn PluginResolver>,
    events: Arc<EventBus>,
    config: Arc<ControlConfig>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<MetricCatalog>,
        router: Arc<Router>,
        resolver: Arc<dyn PluginResolver>,
        events: Arc<EventBus>,
        config: Arc<ControlConfig>,
    ) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            catalog,
            router,
            resolver,
            events,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a task: validate the schedule and workflow, resolve and
    /// subscribe every requested metric, resolve every workflow plugin
    /// reference, then spawn the actor. Nothing is persisted if any
    /// step fails.
    pub async fn create_task(&self, request: CreateTask) -> Result<Task> {
        request.schedule.validate()?;
        request.workflow.validate()?;

        // Resolve metric queries against the catalog as of now and
        // subscribe the concrete records.
        let mut subscriptions: Vec<(String, u32)> = Vec::new();
        let mut deps: HashSet<PluginId> = HashSet::new();
        let result = self.subscribe_workflow(&request.workflow, &mut subscriptions, &mut deps);
        if let Err(e) = result {
            self.unwind_subscriptions(&subscriptions);
            return Err(e);
        }

        // Resolve processors and publishers to loaded plugins.
        let mut resolved_refs: HashMap<PluginId, PluginId> = HashMap::new();
        for requested in request.workflow.plugin_refs() {
            match self
                .resolver
                .resolve_plugin(requested.plugin_type, &requested.name, requested.version)
            {
                Ok(plugin) => {
                    deps.insert(plugin.id.clone());
                    resolved_refs.insert(requested, plugin.id);
                }
                Err(e) => {
                    self.unwind_subscriptions(&subscriptions);
                    return Err(e);
                }
            }
        }

        let mut task = Task::new(request.name, request.schedule, request.workflow);
        if let Some(deadline) = request.deadline {
            task = task.with_deadline(deadline);
        }
        if let Some(limit) = request.stop_on_failure {
            task = task.with_stop_on_failure(limit);
        }

        let watcher = Arc::new(TaskWatcher::new(self.config.watcher_ring_capacity));
        let cancel = self.cancel.child_token();
        let (actor, handle) = TaskActor::new(
            task.clone(),
            deps,
            resolved_refs,
            self.catalog.clone(),
            self.router.clone(),
            self.events.clone(),
            watcher.clone(),
            cancel,
        );
        tokio::spawn(actor.run());

        self.entries.insert(
            task.id.clone(),
            TaskEntry {
                handle: handle.clone(),
                watcher,
                subscriptions,
            },
        );
        info!(task = %task.id, name = %task.name, "task created");

        if request.start {
            handle.start().await?;
            return handle.snapshot().await;
        }
        Ok(task)
    }

    fn subscribe_workflow(
        &self,
        workflow: &WorkflowMap,
        subscriptions: &mut Vec<(String, u32)>,
        deps: &mut HashSet<PluginId>,
    ) -> Result<()> {
        for (query, spec) in &workflow.collect.metrics {
            let records = if has_wildcard(query) {
                let records = self.catalog.fetch(query, spec.version)?;
                if records.is_empty() {
                    return Err(Error::metric_not_found(query, spec.version));
                }
                records
            } else {
                vec![self
                    .catalog
                    .get(query, spec.version)
                    .map_err(|_| Error::metric_not_found(query, spec.version))?]
            };

            for record in records {
                let config = workflow.config_for(&record.namespace);
                let (_, first) =
                    self.catalog
                        .subscribe(&record.namespace, record.version, &config)?;
                subscriptions.push((record.namespace.clone(), record.version));
                if first {
                    self.events.emit(ControlEvent::MetricSubscribed {
                        namespace: record.namespace.clone(),
                        version: record.version,
                    });
                }
                deps.insert(record.owner);
            }
        }
        Ok(())
    }

    fn unwind_subscriptions(&self, subscriptions: &[(String, u32)]) {
        for (namespace, version) in subscriptions {
            if let Ok(last) = self.catalog.unsubscribe(namespace, *version) {
                if last {
                    self.events.emit(ControlEvent::MetricUnsubscribed {
                        namespace: namespace.clone(),
                        version: *version,
                    });
                }
            }
        }
    }

    fn entry_handle(&self, id: &str) -> Result<TaskHandle> {
        self.entries
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub async fn start_task(&self, id: &str) -> Result<()> {
        self.entry_handle(id)?.start().await
    }

    pub async fn stop_task(&self, id: &str) -> Result<()> {
        self.entry_handle(id)?.stop().await
    }

    pub async fn enable_task(&self, id: &str) -> Result<()> {
        self.entry_handle(id)?.enable().await
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.entry_handle(id)?.snapshot().await
    }

    /// Remove a task. Only legal from `Stopped`, `Disabled`, or
    /// `Ended`; subscriptions are released on the way out.
    pub async fn remove_task(&self, id: &str) -> Result<Task> {
        let handle = self.entry_handle(id)?;
        let task = handle.snapshot().await?;
        if !task.state.is_removable() {
            return Err(Error::task_state("Task must be stopped."));
        }
        handle.cancel();
        if let Some((_, entry)) = self.entries.remove(id) {
            self.unwind_subscriptions(&entry.subscriptions);
        }
        debug!(task = %id, "task removed");
        Ok(task)
    }

    /// Snapshot every task, sorted by creation time.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let handles: Vec<TaskHandle> = self
            .entries
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(task) = handle.snapshot().await {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Attach a watch stream to a task's event ring.
    pub fn watch_task(&self, id: &str) -> Result<TaskWatch> {
        self.entries
            .get(id)
            .map(|entry| entry.watcher.watch())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Bus handler: a disabled plugin disables every task depending on
    /// it.
    pub fn disabled_handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(DisabledHandler {
            entries: self.entries.clone(),
        })
    }

    /// Kinds `disabled_handler` should be registered for.
    pub const DISABLED_HANDLER_KINDS: &'static [EventKind] = &[EventKind::PluginDisabled];

    /// Stop every task actor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct DisabledHandler {
    entries: Arc<DashMap<String, TaskEntry>>,
}

impl EventHandler for DisabledHandler {
    fn name(&self) -> &str {
        "scheduler-plugin-disabled"
    }

    fn handle(&self, event: &ControlEvent) -> std::result::Result<(), String> {
        if let ControlEvent::PluginDisabled { plugin, reason, .. } = event {
            for entry in self.entries.iter() {
                entry
                    .handle
                    .notify_plugin_disabled(plugin.clone(), reason.clone());
            }
        }
        Ok(())
    }
}
