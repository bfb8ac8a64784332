//! Shared stubs for loop tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rlm_core::{
    CostSummary, CostTracker, Environment, ExecutionResult, Isolation, ModelClient, Prompt,
    ProviderError,
};

/// A client that replays scripted replies in order and then repeats the last.
pub struct ScriptedClient {
    name: String,
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<Prompt>>,
    costs: CostTracker,
}

impl ScriptedClient {
    pub fn new(replies: Vec<&str>) -> Self {
        Self::with_results(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_results(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            name: "scripted".into(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            costs: CostTracker::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn completion(&self, prompt: &Prompt, _model: Option<&str>) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        self.costs.record(10, 5, 0.0);
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        last.clone()
            .unwrap_or_else(|| Err(ProviderError::Network("no scripted reply".into())))
    }

    fn cost_summary(&self) -> CostSummary {
        self.costs.snapshot()
    }
}

/// Echoes each block back on stdout. Code containing `fail` reports stderr;
/// `set k=v` binds a string variable. Clones share their records.
#[derive(Clone, Default)]
pub struct RecordingEnvironment {
    executed: Arc<Mutex<Vec<String>>>,
    cleaned_up: Arc<AtomicBool>,
}

impl RecordingEnvironment {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Environment for RecordingEnvironment {
    fn name(&self) -> &str {
        "recording"
    }

    fn isolation(&self) -> Isolation {
        Isolation::NonIsolated
    }

    async fn execute_code(&self, code: &str) -> ExecutionResult {
        self.executed.lock().unwrap().push(code.to_string());
        let mut result = ExecutionResult {
            stdout: format!("ran {code}\n"),
            ..ExecutionResult::default()
        };
        if code.contains("fail") {
            result.stderr = "RuntimeError: fail".into();
        }
        if let Some((key, value)) = code.strip_prefix("set ").and_then(|kv| kv.split_once('=')) {
            result
                .variables
                .insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }
        result
    }

    async fn cleanup(&self) {
        self.cleaned_up.store(true, Ordering::SeqCst);
    }
}
