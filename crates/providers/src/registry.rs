//! Backend registry: selects and builds model clients from configuration.
//!
//! Backends are a name → constructor map, so adding one is a single
//! `register` call rather than another branch.

use std::collections::HashMap;
use std::sync::Arc;

use rlm_config::{AppConfig, BackendConfig};
use rlm_core::{ModelClient, ProviderError};

use crate::openai_compat::{OpenAiCompatClient, Pricing};

/// Inputs every backend constructor receives.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub pricing: Option<Pricing>,
}

pub type BackendConstructor = Arc<dyn Fn(BackendOptions) -> Arc<dyn ModelClient> + Send + Sync>;

/// Maps backend names to constructors.
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The built-in backends: openai, openrouter, portkey, ollama.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |options| {
            finish(OpenAiCompatClient::openai(options.api_key.clone(), &options.model), &options)
        });
        registry.register("openrouter", |options| {
            finish(OpenAiCompatClient::openrouter(options.api_key.clone(), &options.model), &options)
        });
        registry.register("portkey", |options| {
            finish(OpenAiCompatClient::portkey(options.api_key.clone(), &options.model), &options)
        });
        registry.register("ollama", |options| {
            finish(OpenAiCompatClient::ollama(None, &options.model), &options)
        });
        registry
    }

    /// Register a constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(BackendOptions) -> Arc<dyn ModelClient> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Build a client for `name`.
    ///
    /// Unregistered names fall back to a generic OpenAI-compatible client
    /// when the options carry a base URL.
    pub fn build(&self, name: &str, options: BackendOptions) -> Result<Arc<dyn ModelClient>, ProviderError> {
        if let Some(constructor) = self.constructors.get(name) {
            return Ok(constructor(options));
        }
        match options.base_url.clone() {
            Some(url) => Ok(finish(
                OpenAiCompatClient::new(name, url, options.api_key.clone(), &options.model),
                &options,
            )),
            None => Err(ProviderError::NotConfigured(format!(
                "unknown backend '{name}' and no api_url configured"
            ))),
        }
    }

    /// List all registered backend names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Apply the overrides every constructor honours.
fn finish(mut client: OpenAiCompatClient, options: &BackendOptions) -> Arc<dyn ModelClient> {
    if let Some(url) = &options.base_url {
        client = client.with_base_url(url);
    }
    if let Some(pricing) = options.pricing {
        client = client.with_pricing(pricing);
    }
    Arc::new(client)
}

/// Get the default base URL for well-known backends.
pub fn default_base_url(backend: &str) -> Option<&'static str> {
    match backend {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "portkey" => Some("https://api.portkey.ai/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

/// The options for `backend` with per-backend overrides applied.
pub fn options_for(config: &AppConfig, backend: &str, model: Option<&str>) -> BackendOptions {
    let overrides = config.backends.get(backend).cloned().unwrap_or_default();
    let BackendConfig {
        api_url,
        model: configured_model,
        input_price_per_m,
        output_price_per_m,
        ..
    } = overrides;

    let pricing = match (input_price_per_m, output_price_per_m) {
        (None, None) => None,
        (input, output) => Some(Pricing {
            input_per_m: input.unwrap_or(0.0),
            output_per_m: output.unwrap_or(0.0),
        }),
    };

    BackendOptions {
        api_key: config.api_key_for(backend),
        base_url: api_url,
        model: model
            .map(str::to_string)
            .or(configured_model)
            .unwrap_or_else(|| config.model.clone()),
        pricing,
    }
}

/// Clients built from configuration.
pub struct ConfiguredClients {
    pub default: Arc<dyn ModelClient>,
    /// Keyed by model name, as registered in the router.
    pub others: Vec<(String, Arc<dyn ModelClient>)>,
}

/// Build the default client plus every `other_backends` entry.
pub fn build_from_config(
    registry: &BackendRegistry,
    config: &AppConfig,
) -> Result<ConfiguredClients, ProviderError> {
    let default = registry.build(
        &config.backend,
        options_for(config, &config.backend, Some(&config.model)),
    )?;

    let mut others = Vec::new();
    for backend in &config.other_backends {
        let client = registry.build(backend, options_for(config, backend, None))?;
        others.push((client.model_name().to_string(), client));
    }

    Ok(ConfiguredClients { default, others })
}
