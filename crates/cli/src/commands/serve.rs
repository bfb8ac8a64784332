//! `rlm serve`: Run a standalone request router.

use std::path::Path;
use std::time::Duration;

use rlm_handler::LmHandler;
use rlm_providers::{BackendRegistry, build_from_config};
use tracing::info;

pub async fn run(config_path: Option<&Path>, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;
    if let Some(port) = port_override {
        config.handler.port = port;
    }

    let clients = build_from_config(&BackendRegistry::with_defaults(), &config)?;
    let handler = LmHandler::new(clients.default)
        .with_host(config.handler.host.clone())
        .with_port(config.handler.port)
        .with_request_timeout(Duration::from_secs(config.handler.request_timeout_secs));
    for (name, client) in clients.others {
        handler.register_client(name, client);
    }

    let addr = handler.start().await?;

    // The bare address on stdout is for scripts; the rest goes to stderr.
    println!("{addr}");
    eprintln!("  Backend:   {}", config.backend);
    eprintln!("  Model:     {}", config.model);
    eprintln!("  Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handler.stop().await;

    for (name, summary) in handler.cost_summaries() {
        info!(
            client = %name,
            calls = summary.total_calls,
            input_tokens = summary.total_input_tokens,
            output_tokens = summary.total_output_tokens,
            cost = summary.total_cost,
            "Usage"
        );
    }

    Ok(())
}
