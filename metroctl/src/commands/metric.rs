//! `metroctl metric` commands.

use crate::cli::MetricCommands;
use crate::client::ControlClient;
use crate::error::Result;
use crate::output;

pub async fn run(client: &ControlClient, command: MetricCommands) -> Result<()> {
    match command {
        MetricCommands::List => {
            let metrics = client.list_metrics().await?;
            output::metric_table(&metrics);
            Ok(())
        }
        MetricCommands::Get { namespace, ver } => {
            let metrics = client.get_metrics(&namespace, ver).await?;
            output::metric_table(&metrics);
            Ok(())
        }
    }
}
