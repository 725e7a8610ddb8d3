//! `metroctl plugin` commands.

use std::path::PathBuf;

use colored::Colorize;

use crate::cli::PluginCommands;
use crate::client::ControlClient;
use crate::error::{CliError, Result};
use crate::output;

/// Environment variable locating installed plugin binaries.
pub const PLUGIN_PATH_ENV: &str = "METROD_PATH";

pub async fn run(client: &ControlClient, command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::Load { plugin, signature } => load(client, &plugin, signature).await,
        PluginCommands::Unload {
            plugin_type,
            name,
            version,
        } => unload(client, &plugin_type, &name, version).await,
        PluginCommands::List { details } => list(client, details).await,
    }
}

/// Resolve a plugin argument: an existing path wins, otherwise the name
/// is looked up under `$METROD_PATH`.
fn resolve_plugin_path(plugin: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(plugin);
    if direct.exists() {
        return Ok(direct);
    }
    if let Ok(base) = std::env::var(PLUGIN_PATH_ENV) {
        let candidate = PathBuf::from(base).join(plugin);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(CliError::usage(format!(
        "plugin not found: {plugin} (set {PLUGIN_PATH_ENV} to locate installed plugins)"
    )))
}

async fn load(client: &ControlClient, plugin: &str, signature: Option<String>) -> Result<()> {
    let path = resolve_plugin_path(plugin)?;
    let bytes = std::fs::read(&path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| CliError::usage("plugin path has no file name"))?;

    let signature = match signature {
        Some(sig_path) => {
            let sig_bytes = std::fs::read(&sig_path)?;
            let sig_name = PathBuf::from(&sig_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("{filename}.asc"));
            Some((sig_name, sig_bytes))
        }
        None => None,
    };

    let loaded = client.load_plugin(&filename, bytes, signature).await?;
    println!("{}", "Plugin loaded".green());
    println!("Name: {}", loaded.name);
    println!("Version: {}", loaded.version);
    println!("Type: {}", loaded.plugin_type);
    println!("Signed: {}", loaded.signed);
    Ok(())
}

async fn unload(
    client: &ControlClient,
    plugin_type: &str,
    name: &str,
    version: u32,
) -> Result<()> {
    let unloaded = client.unload_plugin(plugin_type, name, version).await?;
    println!("{}", "Plugin unloaded".green());
    println!("Name: {}", unloaded.name);
    println!("Version: {}", unloaded.version);
    println!("Type: {}", unloaded.plugin_type);
    Ok(())
}

async fn list(client: &ControlClient, details: bool) -> Result<()> {
    let plugins = client.list_plugins(details).await?;
    output::plugin_table(&plugins.loaded);
    if details {
        println!();
        output::instance_table(&plugins.available);
    }
    Ok(())
}
