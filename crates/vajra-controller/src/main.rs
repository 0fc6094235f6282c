use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vajra_controller::{ControllerSettings, Coordinator};
use vajra_rpc::messages::CONTROLLER_PORT;

/// VajraEdge load-generation controller.
#[derive(Parser, Debug)]
#[command(name = "vajra-controller", version, about)]
struct Args {
    /// Port to serve worker registrations, heartbeats, and metric streams.
    #[arg(long, default_value_t = CONTROLLER_PORT)]
    port: u16,

    /// Minimum healthy workers required to start a distributed test.
    #[arg(long, default_value_t = 1)]
    min_workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let coordinator = Arc::new(Coordinator::new(ControllerSettings {
        min_workers: args.min_workers,
        ..ControllerSettings::default()
    }));

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    coordinator.serve(listener, cancel).await;
    Ok(())
}
