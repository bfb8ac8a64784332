//! `rlm run`: Answer a prompt with the recursive loop.

use std::path::Path;
use std::time::Duration;

use clap::Args;
use rlm_agent::RlmBuilder;
use rlm_core::Environment;
use rlm_environments::{EnvironmentRegistry, LocalEnvironment};
use rlm_providers::{BackendRegistry, build_from_config};
use tracing::warn;

#[derive(Args)]
pub struct RunArgs {
    /// The prompt, or `-` to read it from stdin
    prompt: String,

    /// Override agent.max_iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Override environment.kind (`local`, `remote`)
    #[arg(long = "env")]
    environment: Option<String>,

    /// Print usage totals per client to stderr
    #[arg(long)]
    costs: bool,

    /// Print the whole outcome (iterations, history) as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(config_path: Option<&Path>, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;
    if let Some(max) = args.max_iterations {
        config.agent.max_iterations = max;
    }
    if let Some(kind) = args.environment {
        config.environment.kind = kind;
    }
    config.validate()?;

    // Check for an API key early and give a clear error
    if !config.has_api_key() && config.backend != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured for backend '{}'!", config.backend);
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    RLM_API_KEY         (generic, always wins)");
        eprintln!("    OPENAI_API_KEY      (OpenAI)");
        eprintln!("    OPENROUTER_API_KEY  (OpenRouter)");
        eprintln!("    PORTKEY_API_KEY     (Portkey)");
        eprintln!();
        eprintln!("  Or add api_key to your config file:");
        eprintln!("    {}", rlm_config::AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let prompt = super::read_prompt(args.prompt)?;

    let clients = build_from_config(&BackendRegistry::with_defaults(), &config)?;
    let request_timeout = Duration::from_secs(config.handler.request_timeout_secs);
    let mut environments = EnvironmentRegistry::with_defaults();
    environments.register("local", move |config, addr| {
        let env = LocalEnvironment::from_config(config, addr)?.with_request_timeout(request_timeout);
        Ok(Box::new(env) as Box<dyn Environment>)
    });
    let environment = config.environment.clone();

    let mut builder = RlmBuilder::new(clients.default, move |addr| {
        environments.create(&environment, addr)
    })
    .with_config(&config);
    for (name, client) in clients.others {
        builder = builder.with_client(name, client);
    }

    let rlm = builder.start().await?;
    let outcome = rlm.completion(prompt).await;
    let costs = rlm.cost_summaries();
    rlm.shutdown().await;

    if outcome.exhausted {
        warn!(
            iterations = config.agent.max_iterations,
            "No final answer within the iteration budget"
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.answer);
    }

    if args.costs {
        eprintln!();
        eprintln!("  {:<28} {:>6} {:>10} {:>10} {:>12}", "client", "calls", "input", "output", "cost");
        for (name, summary) in &costs {
            eprintln!(
                "  {:<28} {:>6} {:>10} {:>10} {:>12.6}",
                name,
                summary.total_calls,
                summary.total_input_tokens,
                summary.total_output_tokens,
                summary.total_cost
            );
        }
    }

    Ok(())
}
