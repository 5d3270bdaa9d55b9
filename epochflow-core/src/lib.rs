//! Epoch-synchronized data exchange between upstream producer tasks and downstream consumer tasks.
//!
//! Producers hand their rows to a [shuffle::writer::ShuffleWriter], which routes them through a
//! [partitioner::Partitioner] to one [shuffle::receiver::ReceiverEndpoint] per partition and closes
//! every epoch with a marker. Each source keeps the rows it produced in a
//! [commitlog::tracker::CommitTracker] until the [coordinator] saw every partition finish the
//! epoch. The [generator] drives all of this at a controlled rate and [pipeline] wires it together.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod error;
pub use crate::error::{Error, Result};

pub mod commitlog;
pub mod config;
pub mod coordinator;
pub mod generator;
pub mod message;
mod metrics;
pub use crate::metrics::encode_metrics;
pub mod partitioner;
pub mod pipeline;
pub mod shuffle;

/// Runs the pipeline described by the process configuration until it finishes or a shutdown signal
/// arrives, in which case the epoch in progress is completed before returning.
pub async fn run() -> Result<()> {
    let settings = config::config()?;

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = pipeline::run_pipeline(settings, shutdown_token).await;

    // the pipeline is done, nothing left to shut down
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    match result {
        Ok(report) => {
            info!(
                final_epoch = %report.final_epoch,
                rows = report.rows_consumed,
                "Gracefully Exiting..."
            );
            Ok(())
        }
        Err(e) => {
            error!("Application error: {:?}", e);
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
