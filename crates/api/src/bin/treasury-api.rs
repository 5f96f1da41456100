//! Treasury API Binary
//!
//! Main entry point for the HTTP server: deposit webhook, votes, claims,
//! the manual rebalance trigger, and the status stream.

use std::process;
use std::sync::Arc;
use tracing::{error, info};

use treasury_api::{AppState, Server, ServerConfig};
use treasury_core::{telemetry, TreasuryConfig};

#[tokio::main]
async fn main() {
    telemetry::init();

    info!("starting treasury API");

    let config = match TreasuryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let state = match AppState::connect(&config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("failed to initialize app state: {}", e);
            process::exit(1);
        }
    };

    let server_config =
        ServerConfig { host: config.api_host.clone(), port: config.api_port, enable_cors: config.api_enable_cors };
    let server = Server::new(server_config, state);
    if let Err(e) = server.start().await {
        error!("server error: {}", e);
        process::exit(1);
    }
}
