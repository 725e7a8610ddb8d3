//! Command line definitions.

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Command line client for the metrod control plane.
#[derive(Parser, Debug)]
#[command(name = "metroctl", author, version, about, long_about = None)]
pub struct Args {
    /// Control plane base URL.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8181")]
    pub url: String,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manage plugins.
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Browse the metric catalog.
    Metric {
        #[command(subcommand)]
        command: MetricCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task from a manifest.
    Create(CreateTaskArgs),
    /// List tasks.
    List,
    /// Start a task.
    Start { id: String },
    /// Stop a task.
    Stop { id: String },
    /// Remove a stopped task.
    Remove { id: String },
    /// Re-enable a disabled task.
    Enable { id: String },
    /// Print a re-importable task manifest.
    Export { id: String },
    /// Stream a task's events.
    Watch { id: String },
}

#[derive(ClapArgs, Debug)]
pub struct CreateTaskArgs {
    /// Full task manifest (JSON or YAML, version 1).
    #[arg(long, conflicts_with = "workflow_manifest")]
    pub task_manifest: Option<String>,

    /// Workflow manifest (JSON or YAML); combine with --interval.
    #[arg(long, requires = "interval")]
    pub workflow_manifest: Option<String>,

    /// Collection interval, e.g. 500ms, 1s, 5m.
    #[arg(long)]
    pub interval: Option<String>,

    /// Window start date, format 1-02-2006.
    #[arg(long)]
    pub start_date: Option<String>,

    /// Window start time, format 3:04PM.
    #[arg(long)]
    pub start_time: Option<String>,

    /// Window stop date, format 1-02-2006.
    #[arg(long)]
    pub stop_date: Option<String>,

    /// Window stop time, format 3:04PM.
    #[arg(long)]
    pub stop_time: Option<String>,

    /// Window duration, e.g. 10m; derives the missing endpoint.
    #[arg(long)]
    pub duration: Option<String>,

    /// Task display name.
    #[arg(long)]
    pub name: Option<String>,

    /// Create the task without starting it.
    #[arg(long)]
    pub no_start: bool,
}

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// Load a plugin binary (path, or name looked up in $METROD_PATH).
    Load {
        plugin: String,
        /// Detached signature file (.asc).
        #[arg(long)]
        signature: Option<String>,
    },
    /// Unload a plugin.
    Unload {
        #[arg(value_name = "TYPE")]
        plugin_type: String,
        name: String,
        version: u32,
    },
    /// List loaded plugins.
    List {
        /// Include running instance detail.
        #[arg(long)]
        details: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum MetricCommands {
    /// List the whole catalog.
    List,
    /// Fetch records for a namespace (wildcards allowed).
    Get {
        namespace: String,
        /// Version; 0 means latest.
        #[arg(long, default_value_t = 0)]
        ver: u32,
    },
}
