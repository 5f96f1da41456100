//! Treasury Worker Binary
//!
//! Main entry point for the background rebalance/settlement job consumer.

use std::process;
use tracing::{error, info};

use treasury_core::{telemetry, TreasuryConfig};
use treasury_worker::WorkerLoop;

#[tokio::main]
async fn main() {
    telemetry::init();

    info!("Starting treasury worker");

    let config = match TreasuryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let worker = match WorkerLoop::connect(&config).await {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize worker: {}", e);
            process::exit(1);
        }
    };

    worker.run().await;
}
