//! ModelClient trait: the abstraction over language-model backends.
//!
//! The request router and the orchestration loop only ever see this trait.
//! Concrete implementations (OpenAI-compatible HTTP backends, the nested
//! sub-agent client, test stubs) live in other crates.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::ProviderError;
use crate::message::Prompt;

/// Running usage totals for one model client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_calls: u64,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Concurrency-safe accumulator behind [`CostSummary`].
///
/// A client may be invoked from many router connections at once, so every
/// update takes the lock. Totals are never reset.
#[derive(Debug, Default)]
pub struct CostTracker {
    inner: Mutex<CostSummary>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call.
    pub fn record(&self, input_tokens: u64, output_tokens: u64, cost: f64) {
        let mut summary = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        summary.total_calls += 1;
        summary.total_input_tokens += input_tokens;
        summary.total_output_tokens += output_tokens;
        summary.total_cost += cost;
    }

    pub fn snapshot(&self) -> CostSummary {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The core ModelClient trait.
///
/// `completion` must be safe to call concurrently; implementations keep
/// their own counters consistent under concurrent calls.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// The model this client talks to by default (e.g., "gpt-4o-mini").
    fn model_name(&self) -> &str;

    /// Produce a completion for `prompt`. `model` overrides the default model
    /// for this call only.
    async fn completion(
        &self,
        prompt: &Prompt,
        model: Option<&str>,
    ) -> std::result::Result<String, ProviderError>;

    /// Usage totals for calls made so far.
    fn cost_summary(&self) -> CostSummary;
}

/// Non-blocking completion entry point.
///
/// Detaches the call onto the runtime and hands back a join handle, so a
/// caller can fire several completions and collect them later.
pub fn spawn_completion(
    client: Arc<dyn ModelClient>,
    prompt: Prompt,
    model: Option<String>,
) -> JoinHandle<std::result::Result<String, ProviderError>> {
    tokio::spawn(async move { client.completion(&prompt, model.as_deref()).await })
}
