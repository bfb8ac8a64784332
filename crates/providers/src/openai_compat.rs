//! OpenAI-compatible model client.
//!
//! Works with: OpenAI, OpenRouter, Portkey, Ollama, vLLM and any endpoint
//! exposing `/chat/completions` in the OpenAI shape.

use std::time::Duration;

use async_trait::async_trait;
use rlm_core::{CostSummary, CostTracker, Message, ModelClient, Prompt, ProviderError, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How the credential is attached to each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `<header>: <key>` (Portkey uses `x-portkey-api-key`)
    Header(String),
    /// No credential (local servers)
    None,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

/// A model client for an OpenAI-compatible endpoint.
pub struct OpenAiCompatClient {
    backend: String,
    base_url: String,
    api_key: Option<String>,
    auth: AuthScheme,
    model: String,
    pricing: Option<Pricing>,
    costs: CostTracker,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a new client. The key is only checked when a call is made.
    pub fn new(
        backend: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            backend: backend.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            auth: AuthScheme::Bearer,
            model: model.into(),
            pricing: None,
            costs: CostTracker::new(),
            client,
        }
    }

    /// OpenAI (convenience constructor).
    pub fn openai(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key, model)
    }

    /// OpenRouter (convenience constructor).
    pub fn openrouter(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key, model)
    }

    /// Portkey gateway (convenience constructor).
    pub fn portkey(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new("portkey", "https://api.portkey.ai/v1", api_key, model)
            .with_auth(AuthScheme::Header("x-portkey-api-key".into()))
    }

    /// Ollama (convenience constructor). Needs no key.
    pub fn ollama(base_url: Option<&str>, model: impl Into<String>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            None,
            model,
        )
        .with_auth(AuthScheme::None)
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    /// Point at a different endpoint (self-hosted gateway, proxy).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                },
                content: Some(m.content.clone()),
            })
            .collect()
    }

    /// Cost of one call: USD when priced, otherwise the total token count.
    fn call_cost(&self, usage: &ApiUsage) -> f64 {
        match self.pricing {
            Some(p) => {
                (usage.prompt_tokens as f64 * p.input_per_m
                    + usage.completion_tokens as f64 * p.output_per_m)
                    / 1_000_000.0
            }
            None => usage.total_tokens as f64,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = || {
            self.api_key.as_deref().ok_or_else(|| {
                ProviderError::NotConfigured(format!("no API key for backend '{}'", self.backend))
            })
        };
        Ok(match &self.auth {
            AuthScheme::Bearer => request.header("Authorization", format!("Bearer {}", key()?)),
            AuthScheme::Header(name) => request.header(name.as_str(), key()?),
            AuthScheme::None => request,
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn completion(
        &self,
        prompt: &Prompt,
        model: Option<&str>,
    ) -> Result<String, ProviderError> {
        if prompt.is_empty() {
            return Err(ProviderError::InvalidPrompt("prompt is empty".into()));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let model = model.unwrap_or(&self.model);

        let body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&prompt.to_messages()),
            "stream": false,
        });

        let request = self
            .authorize(self.client.post(&url))?
            .header("Content-Type", "application/json")
            .json(&body);

        debug!(backend = %self.backend, model = %model, "Sending completion request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Backend returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let usage = api_response.usage.unwrap_or_default();
        self.costs.record(
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
            self.call_cost(&usage),
        );

        Ok(choice.message.content.unwrap_or_default())
    }

    fn cost_summary(&self) -> CostSummary {
        self.costs.snapshot()
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}
