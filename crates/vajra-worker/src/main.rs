use std::sync::Arc;

use clap::Parser;

use vajra_core::task::TaskRegistry;
use vajra_rpc::messages::WORKER_BASE_PORT;
use vajra_worker::{WorkerConfig, WorkerRuntime};

/// VajraEdge load-generation worker.
#[derive(Parser, Debug)]
#[command(name = "vajra-worker", version, about)]
struct Args {
    /// Controller RPC address (host:port).
    #[arg(long, default_value = "127.0.0.1:9090")]
    controller: String,

    /// Port to serve assignment RPCs on.
    #[arg(long, default_value_t = WORKER_BASE_PORT)]
    port: u16,

    /// Host the controller should dial back for assignments.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Capacity in target TPS this worker advertises.
    #[arg(long, default_value_t = 1_000)]
    capacity: u32,

    /// Worker id; generated when omitted.
    #[arg(long)]
    worker_id: Option<String>,
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

    let mut config = WorkerConfig::new(args.controller);
    config.host = args.host;
    config.rpc_port = args.port;
    config.max_capacity = args.capacity;
    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }

    let registry = Arc::new(TaskRegistry::with_builtin_tasks());
    let runtime = Arc::new(WorkerRuntime::new(config, registry));

    let cancel = runtime.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    runtime.run().await?;
    Ok(())
}
