//! Local subprocess environment (non-isolated).
//!
//! Each code block runs as `<interpreter> -c <code>` on this machine. The
//! child sees the router's address in `RLM_HANDLER_HOST`/`RLM_HANDLER_PORT`
//! and a JSON variables file in `RLM_VARIABLES_FILE` that carries bindings
//! from one block to the next. `RLM_REQUEST_TIMEOUT` bounds each sub-call
//! in seconds. Python interpreters get a small runner that defines
//! `llm_query`, keeps the variables file in sync, and carries imports,
//! functions and other non-JSON values over in `RLM_STATE_FILE`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rlm_config::EnvironmentConfig;
use rlm_core::{Environment, EnvironmentError, ExecutionResult, Isolation};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PYTHON_RUNNER: &str = include_str!("python_runner.py");

pub struct LocalEnvironment {
    interpreter: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    request_timeout: Duration,
    handler_addr: SocketAddr,
    variables: Mutex<Map<String, Value>>,
    scratch: tempfile::TempDir,
}

impl LocalEnvironment {
    pub fn new(interpreter: impl Into<String>, handler_addr: SocketAddr) -> Result<Self, EnvironmentError> {
        let scratch = tempfile::Builder::new()
            .prefix("rlm-env-")
            .tempdir()
            .map_err(|e| EnvironmentError::Setup(format!("scratch directory: {e}")))?;

        Ok(Self {
            interpreter: interpreter.into(),
            working_dir: None,
            timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            handler_addr,
            variables: Mutex::new(Map::new()),
            scratch,
        })
    }

    pub fn from_config(config: &EnvironmentConfig, handler_addr: SocketAddr) -> Result<Self, EnvironmentError> {
        let mut env = Self::new(config.interpreter.clone(), handler_addr)?
            .with_timeout(Duration::from_secs(config.timeout_secs));
        if let Some(dir) = &config.working_dir {
            env = env.with_working_dir(dir.clone());
        }
        Ok(env)
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound on each `llm_query` / `rlm query` round trip from code.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn is_python(&self) -> bool {
        Path::new(&self.interpreter)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("python"))
    }

    fn variables_path(&self) -> PathBuf {
        self.scratch.path().join("variables.json")
    }

    fn state_path(&self) -> PathBuf {
        self.scratch.path().join("state.pickle")
    }

    fn command(&self, code: &str, variables_path: &Path) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        if self.is_python() {
            cmd.arg("-c")
                .arg(PYTHON_RUNNER)
                .env("RLM_CODE", code)
                .env("RLM_STATE_FILE", self.state_path());
        } else {
            cmd.arg("-c").arg(code);
        }
        cmd.env("RLM_HANDLER_HOST", self.handler_addr.ip().to_string())
            .env("RLM_HANDLER_PORT", self.handler_addr.port().to_string())
            .env("RLM_VARIABLES_FILE", variables_path)
            .env("RLM_REQUEST_TIMEOUT", self.request_timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    fn isolation(&self) -> Isolation {
        Isolation::NonIsolated
    }

    async fn execute_code(&self, code: &str) -> ExecutionResult {
        let mut variables = self.variables.lock().await;
        let path = self.variables_path();
        let started = Instant::now();

        let seeded = serde_json::to_vec(&*variables).unwrap_or_else(|_| b"{}".to_vec());
        if let Err(e) = tokio::fs::write(&path, seeded).await {
            return ExecutionResult::failure(format!("Failed to write variables file: {e}"));
        }

        debug!(interpreter = %self.interpreter, bytes = code.len(), "Executing code block");

        let output = tokio::time::timeout(self.timeout, self.command(code, &path).output()).await;
        let elapsed = started.elapsed().as_secs_f64();

        let mut result = match output {
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "Code block timed out");
                ExecutionResult::failure(format!(
                    "Execution timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                ))
            }
            Ok(Err(e)) => ExecutionResult::failure(format!(
                "Failed to start '{}': {e}",
                self.interpreter
            )),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if !output.status.success() {
                    let code = output.status.code().unwrap_or(-1);
                    debug!(exit_code = code, "Code block exited with failure");
                    if !stderr.is_empty() && !stderr.ends_with('\n') {
                        stderr.push('\n');
                    }
                    stderr.push_str(&format!("[exit code: {code}]"));
                }
                ExecutionResult {
                    stdout,
                    stderr,
                    ..ExecutionResult::default()
                }
            }
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(updated)) => *variables = updated,
                _ => {
                    if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
                        result.stderr.push('\n');
                    }
                    result.stderr.push_str("RLM_VARIABLES_FILE does not hold a JSON object; variables unchanged");
                }
            },
            _ => {}
        }

        result.variables = variables.clone();
        result.execution_time = Some(elapsed);
        result
    }

    async fn cleanup(&self) {
        self.variables.lock().await.clear();
        let _ = tokio::fs::remove_file(self.variables_path()).await;
        let _ = tokio::fs::remove_file(self.state_path()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr() -> SocketAddr {
        "127.0.0.1:4567".parse().unwrap()
    }

    fn sh() -> LocalEnvironment {
        LocalEnvironment::new("sh", addr()).unwrap()
    }

    #[tokio::test]
    async fn captures_stdout() {
        let result = sh().execute_code("echo hello").await;
        assert_eq!(result.stdout, "hello\n");
        assert!(!result.is_error());
        assert!(result.execution_time.is_some());
    }

    #[tokio::test]
    async fn failure_is_stderr_not_error() {
        let result = sh().execute_code("echo oops >&2; exit 3").await;
        assert!(result.is_error());
        assert!(result.stderr.contains("oops"));
        assert!(result.stderr.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn exports_handler_address() {
        let result = sh()
            .execute_code("echo \"$RLM_HANDLER_HOST:$RLM_HANDLER_PORT\"")
            .await;
        assert_eq!(result.stdout.trim(), "127.0.0.1:4567");
    }

    #[tokio::test]
    async fn exports_request_timeout() {
        let result = sh()
            .with_request_timeout(Duration::from_secs(42))
            .execute_code("echo \"$RLM_REQUEST_TIMEOUT\"")
            .await;
        assert_eq!(result.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn variables_carry_between_blocks() {
        let env = sh();
        let first = env
            .execute_code("printf '{\"answer\": 42}' > \"$RLM_VARIABLES_FILE\"")
            .await;
        assert_eq!(first.variables.get("answer"), Some(&json!(42)));

        let second = env.execute_code("cat \"$RLM_VARIABLES_FILE\"").await;
        let seen: Value = serde_json::from_str(&second.stdout).unwrap();
        assert_eq!(seen, json!({"answer": 42}));
        assert_eq!(second.variables.get("answer"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn garbage_variables_file_is_reported() {
        let env = sh();
        let result = env
            .execute_code("echo 'not json' > \"$RLM_VARIABLES_FILE\"")
            .await;
        assert!(result.stderr.contains("RLM_VARIABLES_FILE"));
        assert!(result.variables.is_empty());
    }

    #[tokio::test]
    async fn timeout_becomes_stderr() {
        let env = sh().with_timeout(Duration::from_millis(200));
        let result = env.execute_code("sleep 5").await;
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_interpreter_becomes_stderr() {
        let env = LocalEnvironment::new("definitely-not-an-interpreter", addr()).unwrap();
        let result = env.execute_code("print(1)").await;
        assert!(result.stderr.contains("Failed to start"));
    }

    #[tokio::test]
    async fn working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let env = sh().with_working_dir(dir.path());
        let result = env.execute_code("pwd").await;
        let reported = std::fs::canonicalize(result.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn cleanup_forgets_variables() {
        let env = sh();
        env.execute_code("printf '{\"x\": 1}' > \"$RLM_VARIABLES_FILE\"").await;
        env.cleanup().await;
        let result = env.execute_code("true").await;
        assert!(result.variables.is_empty());
    }

    #[tokio::test]
    async fn python_runner_keeps_bindings() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let env = LocalEnvironment::new("python3", addr()).unwrap();
        let first = env.execute_code("x = 6 * 7\nimport math").await;
        assert!(!first.is_error(), "{}", first.stderr);
        assert_eq!(first.variables.get("x"), Some(&json!(42)));
        assert!(first.variables.get("math").is_none());

        let second = env.execute_code("print(x + 1)").await;
        assert_eq!(second.stdout.trim(), "43");

        let failing = env.execute_code("raise ValueError('bad')").await;
        assert!(failing.stderr.contains("ValueError"));
        assert_eq!(failing.variables.get("x"), Some(&json!(42)));
    }

    fn has_python() -> bool {
        std::process::Command::new("python3").arg("--version").output().is_ok()
    }

    #[tokio::test]
    async fn python_definitions_survive_between_blocks() {
        if !has_python() {
            return;
        }
        let env = LocalEnvironment::new("python3", addr()).unwrap();
        let first = env
            .execute_code(
                "import math\nfrom collections import Counter\ndef helper(n):\n    return n * 2\n\
                 class Box:\n    def __init__(self, v):\n        self.v = v\n\
                 double = lambda n: helper(n) * 2\ns = {1, 2}\nt = (1, 2)\nb = Box(5)",
            )
            .await;
        assert!(!first.is_error(), "{}", first.stderr);

        let second = env
            .execute_code("print(helper(21), math.sqrt(16), double(1), Counter('aab')['a'])")
            .await;
        assert!(!second.is_error(), "{}", second.stderr);
        assert_eq!(second.stdout.trim(), "42 4.0 4 2");

        let third = env
            .execute_code("print(type(s).__name__, type(t).__name__, b.v)")
            .await;
        assert_eq!(third.stdout.trim(), "set tuple 5");
        assert_eq!(third.variables.get("t"), Some(&json!([1, 2])));
    }

    #[tokio::test]
    async fn python_cleanup_forgets_definitions() {
        if !has_python() {
            return;
        }
        let env = LocalEnvironment::new("python3", addr()).unwrap();
        env.execute_code("def helper():\n    return 1\nkept = {1}").await;
        env.cleanup().await;
        let result = env.execute_code("print('helper' in globals(), 'kept' in globals())").await;
        assert_eq!(result.stdout.trim(), "False False");
    }

    #[tokio::test]
    async fn python_runner_reads_request_timeout() {
        if !has_python() {
            return;
        }
        let env = LocalEnvironment::new("python3", addr())
            .unwrap()
            .with_request_timeout(Duration::from_secs(7));
        let result = env
            .execute_code("import os\nprint(os.environ['RLM_REQUEST_TIMEOUT'])")
            .await;
        assert_eq!(result.stdout.trim(), "7");
    }
}
