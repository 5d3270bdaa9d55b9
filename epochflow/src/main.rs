use std::error::Error;
use std::net::SocketAddr;

use tracing::{error, info};

mod server;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = epochflow_core::config::config()
        .map_err(|e| format!("Error loading configuration: {e:?}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = server::start_metrics_server(addr).await {
            error!(?e, "Metrics server failed");
        }
    });

    let result = epochflow_core::run()
        .await
        .map_err(|e| format!("Error running pipeline: {e:?}"));
    metrics_server.abort();
    result?;

    Ok(())
}
