//! Control-plane error types.

use thiserror::Error;

use crate::catalog::policy::PolicyFault;
use crate::plugin::PluginId;

/// Control-plane result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane error type.
///
/// Error kinds map one-to-one onto the REST status codes in
/// `api::error` and onto the human lines printed by `metroctl`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Checksum mismatch on requested plugin to load")]
    Integrity,

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("plugin is already loaded")]
    AlreadyLoaded(PluginId),

    #[error("plugin not found")]
    PluginNotFound(PluginId),

    #[error("Plugin {0} is in use by one or more subscriptions")]
    PluginInUse(PluginId),

    #[error("Plugin handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Plugin {0} is disabled")]
    PluginDisabled(PluginId),

    #[error("Metric not found: {namespace} (version {version})")]
    MetricNotFound { namespace: String, version: u32 },

    #[error("Metric already declared: {namespace} (version {version})")]
    MetricAlreadyDeclared { namespace: String, version: u32 },

    #[error("Config policy rejected the subscription")]
    Policy(Vec<PolicyFault>),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("{0}")]
    TaskStateIllegal(String),

    #[error("Collection exceeded the task deadline")]
    CollectTimeout,

    #[error("Collection partially failed; {collected} of {requested} metrics collected")]
    CollectPartial {
        collected: usize,
        requested: usize,
        /// Namespaces that were collected before the failure.
        succeeded: Vec<String>,
        message: String,
    },

    #[error("No plugin instance available for {0}")]
    RouterNoInstance(PluginId),

    #[error("Watch stream fell behind and was dropped")]
    StreamLagged,

    #[error("failed to rollback after error {rollback} -- {unload}")]
    SwapRollbackFailed { unload: String, rollback: String },

    #[error("Plugin rpc error: {0}")]
    Rpc(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    pub fn task_state(msg: impl Into<String>) -> Self {
        Self::TaskStateIllegal(msg.into())
    }

    pub fn metric_not_found(namespace: impl Into<String>, version: u32) -> Self {
        Self::MetricNotFound {
            namespace: namespace.into(),
            version,
        }
    }

    /// Split a multi-cause error message into its individual causes.
    ///
    /// Compound errors (policy faults, swap rollback) join their causes
    /// with ` -- `; clients print one cause per line.
    pub fn causes(&self) -> Vec<String> {
        match self {
            Error::Policy(faults) => faults.iter().map(|f| f.to_string()).collect(),
            other => other
                .to_string()
                .split(" -- ")
                .map(str::to_string)
                .collect(),
        }
    }
}
