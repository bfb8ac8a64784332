//! RLM CLI: the main entry point.
//!
//! Commands:
//! - `run`   : Answer a prompt with the recursive loop
//! - `serve` : Run a standalone request router
//! - `query` : Send one completion request to a running router
//! - `doctor`: Diagnose configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "rlm",
    about = "Recursive language-model runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.rlm/config.toml)
    #[arg(short, long, global = true, env = "RLM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a prompt with the recursive loop
    Run(commands::run::RunArgs),

    /// Run a standalone request router until Ctrl-C
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one completion request to a running router
    Query(commands::query::QueryArgs),

    /// Diagnose configuration
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; `query` prints its answer on stdout.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => commands::run::run(config, args).await?,
        Commands::Serve { port } => commands::serve::run(config, port).await?,
        Commands::Query(args) => commands::query::run(args).await?,
        Commands::Doctor => commands::doctor::run(config).await?,
    }

    Ok(())
}
