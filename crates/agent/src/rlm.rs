//! The orchestration loop.
//!
//! [`RlmBuilder::start`] binds a request router and builds an execution
//! environment pointed at it; [`Rlm::completion`] then runs
//! prompt → extract code → execute → check for an answer, until a final
//! answer appears or the iteration budget runs out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rlm_config::AppConfig;
use rlm_core::{
    CodeBlock, CostSummary, Environment, EnvironmentError, HandlerError, Iteration, Message,
    ModelClient, Prompt,
};
use rlm_handler::{DEFAULT_HOST, DEFAULT_REQUEST_TIMEOUT, LmHandler};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::parsing::{extract_code_blocks, format_iteration, resolve_final_answer};
use crate::prompts::initial_history;
use crate::subcall::SubRlmClient;

/// Answer returned when the iteration budget runs out.
pub const FALLBACK_ANSWER: &str = "The RLM ran out of iterations and did not find a final answer.";

/// Registration name of the nested sub-agent client.
pub const SUB_RLM_CLIENT: &str = "rlm";

/// Builds the environment once the router's address is known.
pub type MakeEnvironment =
    Arc<dyn Fn(SocketAddr) -> Result<Box<dyn Environment>, EnvironmentError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RlmError {
    #[error("Failed to start request router: {0}")]
    Handler(#[from] HandlerError),

    #[error("Failed to create environment: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Recursion depth {depth} is at the limit of {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },
}

/// Result of one loop run. Running out of iterations is reported here,
/// not as an error.
#[derive(Debug, Clone, Serialize)]
pub struct RlmOutcome {
    pub run_id: Uuid,
    pub answer: String,
    /// True when no final answer was found within the budget.
    pub exhausted: bool,
    /// Completion calls made, failed ones included.
    pub turns: u32,
    pub iterations: Vec<Iteration>,
    /// The full conversation, initial messages included.
    pub history: Vec<Message>,
    pub execution_time: f64,
}

/// Loop settings plus everything needed to stand up a router and an
/// environment. Cloning is cheap; nested runs clone it with `depth + 1`.
#[derive(Clone)]
pub struct RlmBuilder {
    default_client: Arc<dyn ModelClient>,
    clients: Vec<(String, Arc<dyn ModelClient>)>,
    make_environment: MakeEnvironment,
    max_iterations: u32,
    max_depth: u32,
    depth: u32,
    system_prompt: Option<String>,
    max_output_chars: usize,
    handler_host: String,
    handler_port: u16,
    request_timeout: Duration,
}

impl RlmBuilder {
    pub fn new<F>(default_client: Arc<dyn ModelClient>, make_environment: F) -> Self
    where
        F: Fn(SocketAddr) -> Result<Box<dyn Environment>, EnvironmentError> + Send + Sync + 'static,
    {
        Self {
            default_client,
            clients: Vec::new(),
            make_environment: Arc::new(make_environment),
            max_iterations: 10,
            max_depth: 1,
            depth: 0,
            system_prompt: None,
            max_output_chars: 20_000,
            handler_host: DEFAULT_HOST.to_string(),
            handler_port: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Take loop and router settings from `[agent]` and `[handler]`.
    pub fn with_config(mut self, config: &AppConfig) -> Self {
        self.max_iterations = config.agent.max_iterations;
        self.max_depth = config.agent.max_depth;
        self.system_prompt = config.agent.system_prompt.clone();
        self.max_output_chars = config.agent.max_output_chars;
        self.handler_host = config.handler.host.clone();
        self.handler_port = config.handler.port;
        self.request_timeout = Duration::from_secs(config.handler.request_timeout_secs);
        self
    }

    /// Serve `client` under `name` in addition to the default.
    pub fn with_client(mut self, name: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        self.clients.push((name.into(), client));
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_max_depth(mut self, max: u32) -> Self {
        self.max_depth = max;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    pub fn with_handler_host(mut self, host: impl Into<String>) -> Self {
        self.handler_host = host.into();
        self
    }

    pub fn with_handler_port(mut self, port: u16) -> Self {
        self.handler_port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn default_client(&self) -> Arc<dyn ModelClient> {
        self.default_client.clone()
    }

    /// Bind the router, register clients, and build the environment.
    pub async fn start(&self) -> Result<Rlm, RlmError> {
        if self.depth >= self.max_depth {
            return Err(RlmError::DepthExceeded {
                depth: self.depth,
                max_depth: self.max_depth,
            });
        }

        let handler = LmHandler::new(self.default_client.clone())
            .with_host(self.handler_host.clone())
            .with_port(self.handler_port)
            .with_request_timeout(self.request_timeout);
        for (name, client) in &self.clients {
            handler.register_client(name.clone(), client.clone());
        }
        handler.register_client(SUB_RLM_CLIENT, Arc::new(SubRlmClient::new(self.clone())));

        let addr = handler.start().await?;
        let environment = match (self.make_environment)(addr) {
            Ok(environment) => environment,
            Err(e) => {
                handler.stop().await;
                return Err(e.into());
            }
        };

        info!(
            addr = %addr,
            environment = environment.name(),
            depth = self.depth,
            "RLM ready"
        );

        Ok(Rlm {
            handler,
            environment,
            addr,
            max_iterations: self.max_iterations,
            system_prompt: self.system_prompt.clone(),
            max_output_chars: self.max_output_chars,
            depth: self.depth,
        })
    }

    /// Start, answer one prompt, and shut down again.
    pub async fn run(&self, prompt: impl Into<Prompt>) -> Result<RlmOutcome, RlmError> {
        let rlm = self.start().await?;
        let outcome = rlm.completion(prompt).await;
        rlm.shutdown().await;
        Ok(outcome)
    }
}

/// A running loop: owns its router and its environment.
pub struct Rlm {
    handler: LmHandler,
    environment: Box<dyn Environment>,
    addr: SocketAddr,
    max_iterations: u32,
    system_prompt: Option<String>,
    max_output_chars: usize,
    depth: u32,
}

impl Rlm {
    /// Where code inside the environment reaches the router.
    pub fn handler_address(&self) -> SocketAddr {
        self.addr
    }

    pub fn handler(&self) -> &LmHandler {
        &self.handler
    }

    pub fn environment(&self) -> &dyn Environment {
        self.environment.as_ref()
    }

    /// Usage totals of every client the router serves.
    pub fn cost_summaries(&self) -> BTreeMap<String, CostSummary> {
        self.handler.cost_summaries()
    }

    /// Run the loop until a final answer or the iteration budget is spent.
    pub async fn completion(&self, prompt: impl Into<Prompt>) -> RlmOutcome {
        let prompt = prompt.into();
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut history = initial_history(self.system_prompt.as_deref(), &prompt);
        let mut iterations = Vec::new();
        let mut turns = 0;

        info!(run_id = %run_id, depth = self.depth, max_iterations = self.max_iterations, "Starting RLM run");

        for iteration in 1..=self.max_iterations {
            turns += 1;
            let response = match self
                .handler
                .completion(&Prompt::Messages(history.clone()), None)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(run_id = %run_id, iteration, error = %e, "Model call failed");
                    history.push(Message::user(format!("The previous model call failed: {e}")));
                    continue;
                }
            };

            let code = extract_code_blocks(&response);
            debug!(run_id = %run_id, iteration, code_blocks = code.len(), "Model responded");

            let mut code_blocks = Vec::with_capacity(code.len());
            for code in code {
                let result = self.environment.execute_code(&code).await;
                if result.is_error() {
                    debug!(run_id = %run_id, iteration, "Code block reported stderr");
                }
                code_blocks.push(CodeBlock { code, result });
            }

            let current = Iteration { response, code_blocks };
            if let Some(answer) = resolve_final_answer(&current) {
                info!(run_id = %run_id, iteration, "Final answer found");
                history.push(Message::assistant(current.response.clone()));
                iterations.push(current);
                return RlmOutcome {
                    run_id,
                    answer,
                    exhausted: false,
                    turns,
                    iterations,
                    history,
                    execution_time: started.elapsed().as_secs_f64(),
                };
            }

            history.extend(format_iteration(&current, self.max_output_chars));
            iterations.push(current);
        }

        warn!(run_id = %run_id, turns, "Iteration budget exhausted without a final answer");
        RlmOutcome {
            run_id,
            answer: FALLBACK_ANSWER.to_string(),
            exhausted: true,
            turns,
            iterations,
            history,
            execution_time: started.elapsed().as_secs_f64(),
        }
    }

    /// Stop the router and release the environment.
    pub async fn shutdown(&self) {
        self.handler.stop().await;
        self.environment.cleanup().await;
        debug!(addr = %self.addr, "RLM shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::DEFAULT_SYSTEM_PROMPT;
    use crate::test_helpers::{RecordingEnvironment, ScriptedClient};
    use rlm_core::{ProviderError, Role};

    fn builder(client: Arc<ScriptedClient>, env: RecordingEnvironment) -> RlmBuilder {
        RlmBuilder::new(client, move |_addr| Ok(Box::new(env.clone()) as Box<dyn Environment>))
    }

    #[tokio::test]
    async fn answer_on_first_iteration() {
        let client = Arc::new(ScriptedClient::new(vec!["Easy.\nFINAL(4)"]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .run("What is 2 + 2?")
            .await
            .unwrap();

        assert_eq!(outcome.answer, "4");
        assert!(!outcome.exhausted);
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(client.calls(), 1);
        // system + user + one appended entry
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.history[2], Message::assistant("Easy.\nFINAL(4)"));
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_fallback() {
        let client = Arc::new(ScriptedClient::new(vec!["Still thinking."]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .with_max_iterations(3)
            .run("q")
            .await
            .unwrap();

        assert_eq!(client.calls(), 3);
        assert!(outcome.exhausted);
        assert_eq!(outcome.answer, FALLBACK_ANSWER);
        assert_eq!(outcome.iterations.len(), 3);
    }

    #[tokio::test]
    async fn blocks_run_in_order_and_failures_do_not_stop_the_rest() {
        let env = RecordingEnvironment::default();
        let client = Arc::new(ScriptedClient::new(vec![
            "```repl\nA fail\n```\n```repl\nB\n```",
            "FINAL(done)",
        ]));
        let outcome = builder(client.clone(), env.clone()).run("q").await.unwrap();

        assert_eq!(env.executed(), vec!["A fail", "B"]);
        let blocks = &outcome.iterations[0].code_blocks;
        assert_eq!(blocks[0].code, "A fail");
        assert!(blocks[0].result.is_error());
        assert_eq!(blocks[1].result.stdout, "ran B\n");
        assert_eq!(outcome.answer, "done");

        // The second call saw the first iteration's outputs.
        let Prompt::Messages(seen) = &client.prompts()[1] else {
            panic!("loop sends message prompts");
        };
        assert_eq!(seen.len(), 2 + 3);
        assert!(seen[3].content.contains("RuntimeError: fail"));
        assert!(seen[4].content.contains("ran B"));
    }

    #[tokio::test]
    async fn final_var_reads_block_variables() {
        let client = Arc::new(ScriptedClient::new(vec![
            "```repl\nset result=forty-two\n```\nFINAL_VAR(result)",
        ]));
        let outcome = builder(client, RecordingEnvironment::default()).run("q").await.unwrap();
        assert_eq!(outcome.answer, "forty-two");
        assert_eq!(outcome.turns, 1);
    }

    #[tokio::test]
    async fn unresolved_final_var_keeps_going() {
        let client = Arc::new(ScriptedClient::new(vec!["FINAL_VAR(missing)", "FINAL(ok)"]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .run("q")
            .await
            .unwrap();
        assert_eq!(outcome.answer, "ok");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn provider_error_is_folded_into_history() {
        let client = Arc::new(ScriptedClient::with_results(vec![
            Err(ProviderError::Timeout("slow".into())),
            Ok("FINAL(recovered)".into()),
        ]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .run("q")
            .await
            .unwrap();

        assert_eq!(outcome.answer, "recovered");
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(outcome.history[2].role, Role::User);
        assert!(outcome.history[2].content.starts_with("The previous model call failed"));
    }

    #[tokio::test]
    async fn custom_system_prompt_replaces_default() {
        let client = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let outcome = builder(client, RecordingEnvironment::default())
            .with_system_prompt("be brief")
            .run("q")
            .await
            .unwrap();
        assert_eq!(outcome.history[0], Message::system("be brief"));

        let client = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let outcome = builder(client, RecordingEnvironment::default()).run("q").await.unwrap();
        assert_eq!(outcome.history[0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn output_is_truncated_in_history() {
        let client = Arc::new(ScriptedClient::new(vec![
            "```repl\nthis block echoes a long line\n```",
            "FINAL(x)",
        ]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .with_max_output_chars(8)
            .run("q")
            .await
            .unwrap();
        let rendered = &outcome.history[3].content;
        assert!(rendered.contains("REPL output:\nran this\n... (truncated to 8/34 chars)"));
    }

    #[tokio::test]
    async fn environment_receives_router_address_and_is_cleaned_up() {
        let env = RecordingEnvironment::default();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in_factory = seen.clone();
        let env_in_factory = env.clone();
        let client = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let builder = RlmBuilder::new(client, move |addr| {
            *seen_in_factory.lock().unwrap() = Some(addr);
            Ok(Box::new(env_in_factory.clone()) as Box<dyn Environment>)
        });

        let rlm = builder.start().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(rlm.handler_address()));
        assert_eq!(rlm.handler().address().await, Some(rlm.handler_address()));
        rlm.completion("q").await;
        rlm.shutdown().await;
        assert!(env.cleaned_up());
        assert_eq!(rlm.handler().address().await, None);
    }

    #[tokio::test]
    async fn environment_failure_stops_the_router() {
        let client = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let builder = RlmBuilder::new(client, |_addr| {
            Err(EnvironmentError::NotConfigured("no sandbox".into()))
        });
        let err = builder.start().await.err().unwrap();
        assert!(matches!(err, RlmError::Environment(_)));
    }

    #[tokio::test]
    async fn depth_at_limit_refuses_to_start() {
        let client = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let err = builder(client, RecordingEnvironment::default())
            .with_max_depth(2)
            .with_depth(2)
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RlmError::DepthExceeded { depth: 2, max_depth: 2 }));
    }

    #[tokio::test]
    async fn cost_summaries_cover_all_clients() {
        let default = Arc::new(ScriptedClient::new(vec!["FINAL(x)"]));
        let other = Arc::new(ScriptedClient::new(vec!["y"]).named("small-model"));
        let rlm = builder(default, RecordingEnvironment::default())
            .with_client("small-model", other)
            .start()
            .await
            .unwrap();
        rlm.completion("q").await;
        let costs = rlm.cost_summaries();
        rlm.shutdown().await;

        assert_eq!(costs["scripted"].total_calls, 1);
        assert_eq!(costs["small-model"].total_calls, 0);
        assert_eq!(costs[SUB_RLM_CLIENT].total_calls, 0);
    }

    #[tokio::test]
    async fn uses_config_settings() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 2;
        config.agent.system_prompt = Some("from config".into());
        let client = Arc::new(ScriptedClient::new(vec!["nope"]));
        let outcome = builder(client.clone(), RecordingEnvironment::default())
            .with_config(&config)
            .run("q")
            .await
            .unwrap();
        assert_eq!(client.calls(), 2);
        assert_eq!(outcome.history[0].content, "from config");
    }
}
