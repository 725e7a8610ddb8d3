use std::sync::Arc;

use metrod::api::ApiServer;
use metrod::config::ControlConfig;
use metrod::services::ServiceContainer;

#[tokio::main]
async fn main() -> metrod::Result<()> {
    let _guard = metrod::logging::init(None);

    // Optional config file as the only positional argument.
    let config = match std::env::args().nth(1) {
        Some(path) => ControlConfig::from_file(std::path::Path::new(&path))?,
        None => ControlConfig::default(),
    };

    let container = Arc::new(ServiceContainer::new(config)?);
    let server = ApiServer::new(container.clone());
    let cancel = server.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    server.run().await?;
    container.shutdown().await;
    Ok(())
}
