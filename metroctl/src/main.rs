mod cli;
mod client;
mod commands;
mod error;
mod output;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::cli::{Args, Commands};
use crate::client::ControlClient;
use crate::error::Result;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        // Multi-cause errors come back joined with a separator; print
        // one cause per line.
        eprintln!("{}", "Error:".red().bold());
        for cause in e.causes() {
            eprintln!("{cause}");
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "metroctl=debug" } else { "metroctl=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let client = ControlClient::new(&args.url);
    match args.command {
        Commands::Task { command } => commands::task::run(&client, command).await,
        Commands::Plugin { command } => commands::plugin::run(&client, command).await,
        Commands::Metric { command } => commands::metric::run(&client, command).await,
    }
}
