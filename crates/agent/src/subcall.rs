//! Nested sub-agent calls.
//!
//! Code running in an environment can ask the router for model `"rlm"`.
//! That request lands here and runs a whole child loop one level deeper,
//! with its own router and environment. At the depth limit the call
//! degrades to a plain completion on the default client.

use async_trait::async_trait;
use rlm_core::{CostSummary, CostTracker, ModelClient, Prompt, ProviderError};
use tracing::{debug, info};

use crate::rlm::RlmBuilder;

pub struct SubRlmClient {
    parent: RlmBuilder,
    costs: CostTracker,
}

impl SubRlmClient {
    /// `parent` is the configuration of the loop that serves this client.
    pub fn new(parent: RlmBuilder) -> Self {
        Self {
            parent,
            costs: CostTracker::new(),
        }
    }

    /// Whether a call would start a child loop rather than degrade.
    pub fn can_nest(&self) -> bool {
        self.parent.depth() + 1 < self.parent.max_depth()
    }
}

#[async_trait]
impl ModelClient for SubRlmClient {
    fn model_name(&self) -> &str {
        crate::rlm::SUB_RLM_CLIENT
    }

    async fn completion(&self, prompt: &Prompt, model: Option<&str>) -> Result<String, ProviderError> {
        if !self.can_nest() {
            debug!(
                depth = self.parent.depth(),
                max_depth = self.parent.max_depth(),
                "Depth limit reached, answering with a plain completion"
            );
            return self.parent.default_client().completion(prompt, model).await;
        }

        let child = self
            .parent
            .clone()
            .with_depth(self.parent.depth() + 1)
            .with_handler_port(0);
        info!(depth = child.depth(), "Starting nested RLM");

        let rlm = child
            .start()
            .await
            .map_err(|e| ProviderError::SubAgent(e.to_string()))?;
        let outcome = rlm.completion(prompt.clone()).await;
        let child_costs = rlm.cost_summaries();
        rlm.shutdown().await;

        let (input, output, cost) = child_costs.values().fold((0, 0, 0.0), |acc, c| {
            (
                acc.0 + c.total_input_tokens,
                acc.1 + c.total_output_tokens,
                acc.2 + c.total_cost,
            )
        });
        self.costs.record(input, output, cost);

        Ok(outcome.answer)
    }

    /// Totals of nested runs only; degraded calls are counted by the
    /// default client itself.
    fn cost_summary(&self) -> CostSummary {
        self.costs.snapshot()
    }
}
