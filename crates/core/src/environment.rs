//! Environment trait: the abstraction over code-execution backends.
//!
//! An environment runs one code block at a time and reports what happened.
//! It is built with the request router's address so code running inside it
//! can ask for completions over the wire protocol; it never holds a model
//! client itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of running one code block.
///
/// Failures of the code (exceptions, non-zero exit, timeouts) are reported
/// through `stderr`, never as a Rust error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Named values bound during execution. Opaque to the loop except for
    /// `FINAL_VAR` resolution.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Wall-clock seconds, when measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

impl ExecutionResult {
    /// A result carrying only an error description.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.stderr.is_empty()
    }
}

/// A code block paired with the result of executing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub result: ExecutionResult,
}

/// One pass of the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    /// Raw model response text.
    pub response: String,
    /// Executed blocks in the order they appeared in `response`.
    pub code_blocks: Vec<CodeBlock>,
}

/// Whether code shares the orchestrator's machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Same machine; may also use loopback call-backs.
    NonIsolated,
    /// Separate machine; the router's network address is the only channel back.
    Isolated,
}

#[async_trait]
pub trait Environment: Send + Sync {
    /// Short identifier used in logs (e.g., "local", "remote").
    fn name(&self) -> &str;

    fn isolation(&self) -> Isolation;

    /// Run one code block to completion.
    async fn execute_code(&self, code: &str) -> ExecutionResult;

    /// Release resources. Called once when the owning loop shuts down.
    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_error() {
        let result = ExecutionResult::failure("boom");
        assert!(result.is_error());
        assert!(result.stdout.is_empty());
        assert!(result.execution_time.is_none());
    }

    #[test]
    fn deserializes_partial_result() {
        let result: ExecutionResult =
            serde_json::from_value(serde_json::json!({"stdout": "ok\n"})).unwrap();
        assert_eq!(result.stdout, "ok\n");
        assert!(!result.is_error());
        assert!(result.variables.is_empty());
    }

    #[test]
    fn isolation_serializes_snake_case() {
        let json = serde_json::to_string(&Isolation::NonIsolated).unwrap();
        assert_eq!(json, "\"non_isolated\"");
    }
}
