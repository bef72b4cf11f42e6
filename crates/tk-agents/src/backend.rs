use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tk_sandbox::container::ContainerError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The container is not running or the CLI did not answer a probe.
    #[error("backend not ready: {0}")]
    NotReady(String),
    /// The CLI binary is missing from the container image.
    #[error("claude cli not installed in container {0}")]
    NotInstalled(String),
    #[error("execution failed: {context}")]
    Execution { context: String },
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

pub type Result<T> = std::result::Result<T, BackendError>;

// ---------------------------------------------------------------------------
// Run options and results
// ---------------------------------------------------------------------------

/// Per-invocation knobs for a backend run.
///
/// Unset fields fall back to whatever the caller layered beneath them (agent
/// record, then config defaults).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    pub fn with_disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.disallowed_tools = Some(tools);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a single backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: Option<String>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && matches!(self.exit_code, None | Some(0))
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Receives live output chunks during a followed run.
pub trait OutputSink: Send + Sync {
    fn push(&self, chunk: &[u8]);
}

/// Discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn push(&self, _chunk: &[u8]) {}
}

impl OutputSink for flume::Sender<Vec<u8>> {
    fn push(&self, chunk: &[u8]) {
        // A dropped receiver just stops the follow; the run itself continues.
        let _ = self.send(chunk.to_vec());
    }
}

// ---------------------------------------------------------------------------
// ExecutionBackend trait
// ---------------------------------------------------------------------------

/// Seam between the orchestration layers and the CLI living inside a
/// container. Implementations shell into the container; tests substitute
/// scripted fakes.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Probe that the container is running and the CLI answers.
    async fn ready(&self, container: &str) -> Result<()>;

    /// First-boot hook: install the CLI when the image ships without it,
    /// then re-probe.
    async fn ensure_installed(&self, container: &str) -> Result<()>;

    /// One-shot run with captured output.
    async fn run(&self, container: &str, prompt: &str, opts: &RunOptions)
        -> Result<ExecutionResult>;

    /// Streaming run: forward each chunk to the sink while accumulating the
    /// transcript for session-id extraction.
    async fn run_follow(
        &self,
        container: &str,
        prompt: &str,
        opts: &RunOptions,
        sink: &dyn OutputSink,
    ) -> Result<ExecutionResult>;

    /// Whether a CLI process is currently running in the container. Probe
    /// failures report false.
    async fn is_executing(&self, container: &str) -> bool;

    /// CLI version string from inside the container.
    async fn version(&self, container: &str) -> Result<String>;
}

/// Pull the session id out of stream-json output.
///
/// The CLI emits newline-delimited JSON events; the first event carrying a
/// non-empty `session_id` wins. Lines that fail to parse are skipped.
pub fn extract_session_id(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_from_stream_json() {
        let output = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"abc-123\"}\n",
            "{\"type\":\"assistant\",\"session_id\":\"abc-123\"}\n",
        );
        assert_eq!(extract_session_id(output).as_deref(), Some("abc-123"));
    }

    #[test]
    fn session_id_skips_malformed_and_empty() {
        let output = "not json at all\n{\"session_id\":\"\"}\n{\"session_id\":\"real-id\"}\n";
        assert_eq!(extract_session_id(output).as_deref(), Some("real-id"));
    }

    #[test]
    fn session_id_absent() {
        assert_eq!(extract_session_id(""), None);
        assert_eq!(extract_session_id("{\"type\":\"result\"}"), None);
    }

    #[test]
    fn run_options_builder() {
        let opts = RunOptions::new()
            .with_model("sonnet")
            .with_max_turns(10)
            .with_allowed_tools(vec!["Bash".to_string(), "Read".to_string()])
            .with_timeout(Duration::from_secs(60));
        assert_eq!(opts.model.as_deref(), Some("sonnet"));
        assert_eq!(opts.max_turns, Some(10));
        assert_eq!(opts.allowed_tools.as_ref().map(Vec::len), Some(2));
        assert_eq!(opts.timeout, Some(Duration::from_secs(60)));
        assert!(opts.system_prompt.is_none());
    }

    #[test]
    fn execution_result_success_requires_clean_exit() {
        let mut result = ExecutionResult {
            session_id: None,
            output: String::new(),
            exit_code: Some(0),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            error: None,
        };
        assert!(result.success());

        result.exit_code = Some(2);
        assert!(!result.success());

        result.exit_code = Some(0);
        result.error = Some("backend exploded".to_string());
        assert!(!result.success());
    }

    #[test]
    fn flume_sender_sink_forwards_chunks() {
        let (tx, rx) = flume::unbounded::<Vec<u8>>();
        tx.push(b"chunk");
        assert_eq!(rx.try_recv().unwrap(), b"chunk".to_vec());

        drop(rx);
        // Dropped receiver must not panic the sender side.
        tx.push(b"late");
    }
}
