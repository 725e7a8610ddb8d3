//! API view models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::{LoadedPlugin, PluginType};
use crate::pool::AvailableInstance;
use crate::scheduler::{format_duration, Schedule, Task};
use crate::workflow::WorkflowMap;

/// A loaded plugin as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginView {
    pub name: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub signed: bool,
    pub status: String,
    pub loaded_timestamp: i64,
}

impl From<LoadedPlugin> for PluginView {
    fn from(plugin: LoadedPlugin) -> Self {
        Self {
            name: plugin.id.name.clone(),
            version: plugin.id.version,
            plugin_type: plugin.id.plugin_type,
            signed: plugin.signed,
            status: plugin.status.to_string(),
            loaded_timestamp: plugin.loaded_at.timestamp(),
        }
    }
}

/// Plugin listing: catalog entries plus (optionally) live instances.
#[derive(Debug, Clone, Serialize)]
pub struct PluginListResponse {
    pub loaded: Vec<PluginView>,
    pub available: Vec<AvailableInstance>,
}

/// A task as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub name: String,
    /// User-facing state name; spinning and firing both read "Running".
    pub state: String,
    pub hit_count: u64,
    pub miss_count: u64,
    pub fail_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub deadline: String,
    pub creation_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    pub schedule: Schedule,
    pub workflow: WorkflowMap,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let deadline = format_duration(task.deadline());
        Self {
            id: task.id,
            name: task.name,
            state: task.state.as_str().to_string(),
            hit_count: task.hit_count,
            miss_count: task.miss_count,
            fail_count: task.fail_count,
            last_failure: task.last_failure,
            deadline,
            creation_time: task.created_at,
            last_run_time: task.last_run,
            schedule: task.schedule,
            workflow: task.workflow,
        }
    }
}

/// The task manifest accepted by create and produced by export.
///
/// `version` is the manifest format version and must be 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub schedule: Schedule,
    pub workflow: WorkflowMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_failure: Option<u32>,
    /// Start the task immediately after creation.
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

impl TaskManifest {
    /// Export form of an existing task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            version: 1,
            name: Some(task.name.clone()),
            schedule: task.schedule.clone(),
            workflow: task.workflow.clone(),
            deadline: Some(format_duration(task.deadline())),
            stop_on_failure: Some(task.stop_on_failure),
            start: false,
        }
    }
}

/// A catalog record as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricView {
    pub namespace: String,
    pub version: u32,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub subscriptions: u64,
}

impl From<crate::catalog::record::MetricTypeRecord> for MetricView {
    fn from(record: crate::catalog::record::MetricTypeRecord) -> Self {
        Self {
            namespace: record.namespace,
            version: record.version,
            data_type: record.data_type,
            unit: record.unit,
            description: record.description,
            subscriptions: record.subscriptions,
        }
    }
}
