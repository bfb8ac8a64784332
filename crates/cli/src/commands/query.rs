//! `rlm query`: One wire-protocol exchange with a running router.
//!
//! Meant to be called from code running in an environment, which finds the
//! router through `RLM_HANDLER_HOST` / `RLM_HANDLER_PORT`.

use std::time::Duration;

use clap::Args;
use rlm_protocol::{CompletionRequest, CompletionResponse, send_request};

#[derive(Args)]
pub struct QueryArgs {
    /// The prompt, or `-` to read it from stdin
    prompt: String,

    /// Registered client to use instead of the default
    #[arg(short, long)]
    model: Option<String>,

    /// Router address as HOST:PORT; takes precedence over --host/--port
    #[arg(long)]
    addr: Option<String>,

    #[arg(long, env = "RLM_HANDLER_HOST")]
    host: Option<String>,

    #[arg(long, env = "RLM_HANDLER_PORT")]
    port: Option<u16>,

    /// Bound on the whole exchange
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

impl QueryArgs {
    fn address(&self) -> Option<String> {
        if let Some(addr) = &self.addr {
            return Some(addr.clone());
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

pub async fn run(args: QueryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args
        .address()
        .ok_or("No router address: pass --addr or set RLM_HANDLER_HOST and RLM_HANDLER_PORT")?;
    let prompt = super::read_prompt(args.prompt)?;

    let mut request = CompletionRequest::new(prompt);
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    let timeout = Duration::from_secs(args.timeout_secs);

    let response =
        tokio::task::spawn_blocking(move || send_request(addr, &request, timeout)).await?;

    match response {
        CompletionResponse::Content(content) => {
            println!("{content}");
            Ok(())
        }
        CompletionResponse::Error(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    }
}
