//! Remote sandbox environment (isolated).
//!
//! Code is shipped to a sandbox service over HTTP. The sandbox runs on a
//! different machine and reaches the router only through the host/port it
//! is told about in each request.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rlm_config::EnvironmentConfig;
use rlm_core::{Environment, EnvironmentError, ExecutionResult, Isolation};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    handler_host: &'a str,
    handler_port: u16,
}

pub struct RemoteEnvironment {
    url: String,
    api_key: Option<String>,
    handler_host: String,
    handler_port: u16,
    client: reqwest::Client,
}

impl RemoteEnvironment {
    pub fn new(url: impl Into<String>, handler_addr: SocketAddr, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api_key: None,
            handler_host: handler_addr.ip().to_string(),
            handler_port: handler_addr.port(),
            client,
        }
    }

    pub fn from_config(config: &EnvironmentConfig, handler_addr: SocketAddr) -> Result<Self, EnvironmentError> {
        let url = config.url.clone().ok_or_else(|| {
            EnvironmentError::NotConfigured("remote environment needs environment.url".into())
        })?;
        let mut env = Self::new(url, handler_addr, Duration::from_secs(config.timeout_secs));
        env.api_key = config.api_key.clone();
        Ok(env)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// The host the sandbox should dial back to, when the router's bind
    /// address is not reachable from the sandbox (e.g. bound to 0.0.0.0).
    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.handler_host = host.into();
        self
    }

    async fn post(&self, code: &str) -> Result<ExecutionResult, String> {
        let body = ExecuteRequest {
            code,
            handler_host: &self.handler_host,
            handler_port: self.handler_port,
        };

        let mut request = self.client.post(format!("{}/execute", self.url)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("Remote sandbox unreachable: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("Remote sandbox returned {}: {text}", status.as_u16()));
        }

        response
            .json::<ExecutionResult>()
            .await
            .map_err(|e| format!("Remote sandbox sent an invalid result: {e}"))
    }
}

#[async_trait]
impl Environment for RemoteEnvironment {
    fn name(&self) -> &str {
        "remote"
    }

    fn isolation(&self) -> Isolation {
        Isolation::Isolated
    }

    async fn execute_code(&self, code: &str) -> ExecutionResult {
        debug!(url = %self.url, bytes = code.len(), "Sending code block to sandbox");
        let started = Instant::now();
        let mut result = self.post(code).await.unwrap_or_else(|e| {
            warn!(url = %self.url, error = %e, "Remote execution failed");
            ExecutionResult::failure(e)
        });
        if result.execution_time.is_none() {
            result.execution_time = Some(started.elapsed().as_secs_f64());
        }
        result
    }
}
