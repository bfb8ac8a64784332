//! Configuration loading, validation, and management for RLM.
//!
//! Loads configuration from `~/.rlm/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Backends that need no `[backends.<name>]` table to be usable.
pub const BUILTIN_BACKENDS: &[&str] = &["openai", "openrouter", "portkey", "ollama"];

/// The root configuration structure.
///
/// Maps directly to `~/.rlm/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key shared by every backend without its own key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Backend of the default model client
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Model of the default model client
    #[serde(default = "default_model")]
    pub model: String,

    /// Additional backends registered in the router under their model name
    #[serde(default)]
    pub other_backends: Vec<String>,

    /// Request router settings
    #[serde(default)]
    pub handler: HandlerConfig,

    /// Orchestration loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Code execution settings
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Backend-specific overrides
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

fn default_backend() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("other_backends", &self.other_backends)
            .field("handler", &self.handler)
            .field("agent", &self.agent)
            .field("environment", &self.environment)
            .field("backends", &self.backends)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL override (e.g. a self-hosted gateway)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model used when this backend is registered as an additional client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// USD per million prompt tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_price_per_m: Option<f64>,

    /// USD per million completion tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_price_per_m: Option<f64>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("input_price_per_m", &self.input_price_per_m)
            .field("output_price_per_m", &self.output_price_per_m)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// 0 means "let the OS pick"
    #[serde(default)]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Nesting bound for sub-agent calls. 1 means no nesting.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Replaces the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Per-stream cap on execution output folded into history
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_max_depth() -> u32 {
    1
}
fn default_max_output_chars() -> usize {
    20_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_depth: default_max_depth(),
            system_prompt: None,
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// "local" or "remote"
    #[serde(default = "default_environment_kind")]
    pub kind: String,

    /// Interpreter invoked as `<interpreter> -c <code>` by the local environment
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_environment_timeout_secs")]
    pub timeout_secs: u64,

    /// Base URL of a remote sandbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_environment_kind() -> String {
    "local".into()
}
fn default_interpreter() -> String {
    "python3".into()
}
fn default_environment_timeout_secs() -> u64 {
    60
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: default_environment_kind(),
            interpreter: default_interpreter(),
            working_dir: None,
            timeout_secs: default_environment_timeout_secs(),
            url: None,
            api_key: None,
        }
    }
}

impl std::fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("kind", &self.kind)
            .field("interpreter", &self.interpreter)
            .field("working_dir", &self.working_dir)
            .field("timeout_secs", &self.timeout_secs)
            .field("url", &self.url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.rlm/config.toml).
    ///
    /// Also checks environment variables:
    /// - `RLM_API_KEY` (highest priority, replaces the file's key)
    /// - `OPENAI_API_KEY`, `PORTKEY_API_KEY`, `OPENROUTER_API_KEY` (only when no key is set)
    /// - `RLM_BACKEND`, `RLM_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_path(&Self::config_dir().join("config.toml"))
    }

    /// Like [`load`](Self::load) but from an explicit file.
    pub fn load_with_path(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("RLM_API_KEY") {
            self.api_key = Some(key);
        } else if self.api_key.is_none() {
            self.api_key = lookup("OPENAI_API_KEY")
                .or_else(|| lookup("PORTKEY_API_KEY"))
                .or_else(|| lookup("OPENROUTER_API_KEY"));
        }

        if let Some(backend) = lookup("RLM_BACKEND") {
            self.backend = backend;
        }

        if let Some(model) = lookup("RLM_MODEL") {
            self.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".rlm")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.handler.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "handler.request_timeout_secs must be at least 1".into(),
            ));
        }

        if self.environment.kind == "remote" && self.environment.url.is_none() {
            return Err(ConfigError::ValidationError(
                "environment.url is required for the remote environment".into(),
            ));
        }

        for name in std::iter::once(&self.backend).chain(&self.other_backends) {
            if !self.is_known_backend(name) {
                return Err(ConfigError::ValidationError(format!(
                    "unknown backend '{name}': use one of {} or add [backends.{name}] with api_url",
                    BUILTIN_BACKENDS.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// A backend is known when it is built in or has its own `api_url`.
    pub fn is_known_backend(&self, name: &str) -> bool {
        BUILTIN_BACKENDS.contains(&name)
            || self
                .backends
                .get(name)
                .is_some_and(|b| b.api_url.is_some())
    }

    /// The credential for `backend`: its own key, else the shared one.
    pub fn api_key_for(&self, backend: &str) -> Option<String> {
        self.backends
            .get(backend)
            .and_then(|b| b.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Check if an API key is available for the default backend.
    pub fn has_api_key(&self) -> bool {
        self.api_key_for(&self.backend).is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            backend: default_backend(),
            model: default_model(),
            other_backends: Vec::new(),
            handler: HandlerConfig::default(),
            agent: AgentConfig::default(),
            environment: EnvironmentConfig::default(),
            backends: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
