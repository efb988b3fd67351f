//! orbd - federated DID anchoring daemon
//!
//! Accepts Sidetree operations, batches them into content-addressed
//! anchor linksets, collects witness countersignatures, and federates
//! anchor events to peers over signed HTTP.

use clap::Parser;
use orbd::config::Config;
use orbd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(config: &Config) {
    let default = if config.verbose { "orbd=debug" } else { "orbd=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(default.parse().unwrap_or_default());

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config);

    info!("orbd v{}", env!("CARGO_PKG_VERSION"));

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_tx = server.shutdown_sender();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    if let Err(e) = server.run().await {
        error!("server error: {e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
