use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tk_sandbox::container::{ContainerControl, ExecOutput, ExecSpec};

use crate::backend::{
    extract_session_id, BackendError, ExecutionBackend, ExecutionResult, OutputSink, Result,
    RunOptions,
};

// ---------------------------------------------------------------------------
// ClaudeRunner
// ---------------------------------------------------------------------------

/// Execution backend that drives the `claude` CLI inside an agent container.
///
/// Every invocation is a `docker exec` into the long-lived container, run in
/// the mounted worktree. Output is requested as stream-json so the session id
/// can be recovered from the event stream.
pub struct ClaudeRunner {
    containers: Arc<dyn ContainerControl>,
    workdir: String,
}

impl ClaudeRunner {
    pub fn new(containers: Arc<dyn ContainerControl>) -> Self {
        Self {
            containers,
            workdir: "/workspace".to_string(),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    fn build_command(prompt: &str, opts: &RunOptions) -> Vec<String> {
        let mut cmd = vec![
            "claude".to_string(),
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = &opts.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        if let Some(turns) = opts.max_turns {
            cmd.push("--max-turns".to_string());
            cmd.push(turns.to_string());
        }
        if let Some(tools) = &opts.allowed_tools {
            if !tools.is_empty() {
                cmd.push("--allowedTools".to_string());
                cmd.push(tools.join(","));
            }
        }
        if let Some(tools) = &opts.disallowed_tools {
            if !tools.is_empty() {
                cmd.push("--disallowedTools".to_string());
                cmd.push(tools.join(","));
            }
        }
        if let Some(extra) = &opts.system_prompt {
            cmd.push("--append-system-prompt".to_string());
            cmd.push(extra.clone());
        }
        cmd
    }

    fn exec_spec(&self, prompt: &str, opts: &RunOptions) -> ExecSpec {
        ExecSpec::new(Self::build_command(prompt, opts)).with_workdir(self.workdir.clone())
    }
}

/// Whether output indicates the CLI binary itself is missing, as opposed to
/// the CLI failing.
fn missing_binary_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("executable file not found")
        || lower.contains("command not found")
        || lower.contains("claude: not found")
}

fn missing_binary(out: &ExecOutput) -> bool {
    missing_binary_text(&out.stderr) || missing_binary_text(&out.stdout)
}

fn run_error_message(out: &ExecOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        format!("claude exited with code {}", out.exit_code)
    } else {
        stderr.to_string()
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ClaudeRunner {
    async fn ready(&self, container: &str) -> Result<()> {
        if !self.containers.is_running(container).await? {
            return Err(BackendError::NotReady(format!(
                "container {container} is not running"
            )));
        }
        self.version(container).await?;
        Ok(())
    }

    async fn ensure_installed(&self, container: &str) -> Result<()> {
        match self.version(container).await {
            Ok(version) => {
                debug!(container = %container, version = %version, "claude cli present");
                return Ok(());
            }
            Err(BackendError::NotInstalled(_)) => {}
            Err(e) => return Err(e),
        }

        info!(container = %container, "installing claude cli");
        let install = ExecSpec::new(["npm", "install", "-g", "@anthropic-ai/claude-code"]);
        let out = self.containers.exec(container, &install).await?;
        if !out.success() {
            return Err(BackendError::Execution {
                context: format!("npm install failed: {}", out.stderr.trim()),
            });
        }

        let version = self.version(container).await?;
        info!(container = %container, version = %version, "claude cli installed");
        Ok(())
    }

    async fn run(
        &self,
        container: &str,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let spec = self.exec_spec(prompt, opts);
        info!(container = %container, "invoking claude");

        let exec = self.containers.exec(container, &spec);
        let out = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, exec).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(container = %container, timeout = ?limit, "run timed out");
                    return Err(BackendError::Timeout(limit));
                }
            },
            None => exec.await?,
        };

        if !out.success() && missing_binary(&out) {
            return Err(BackendError::NotInstalled(container.to_string()));
        }

        let output = out.combined();
        Ok(ExecutionResult {
            session_id: extract_session_id(&output),
            error: (!out.success()).then(|| run_error_message(&out)),
            exit_code: Some(out.exit_code),
            output,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn run_follow(
        &self,
        container: &str,
        prompt: &str,
        opts: &RunOptions,
        sink: &dyn OutputSink,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let spec = self.exec_spec(prompt, opts);
        info!(container = %container, "invoking claude (follow)");

        let stream = self.containers.exec_stream(container, &spec).await?;
        let abort = stream.abort_handle();
        let rx = stream.chunks.clone();

        let consume = async move {
            let mut transcript: Vec<u8> = Vec::new();
            while let Ok(chunk) = rx.recv_async().await {
                sink.push(&chunk);
                transcript.extend_from_slice(&chunk);
            }
            let code = stream.wait().await?;
            Ok::<_, BackendError>((transcript, code))
        };

        let (transcript, exit_code) = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, consume).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(container = %container, timeout = ?limit, "followed run timed out, aborting exec");
                    abort.abort();
                    return Err(BackendError::Timeout(limit));
                }
            },
            None => consume.await?,
        };

        let output = String::from_utf8_lossy(&transcript).to_string();
        if exit_code != 0 && missing_binary_text(&output) {
            return Err(BackendError::NotInstalled(container.to_string()));
        }

        Ok(ExecutionResult {
            session_id: extract_session_id(&output),
            error: (exit_code != 0).then(|| format!("claude exited with code {exit_code}")),
            exit_code: Some(exit_code),
            output,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn is_executing(&self, container: &str) -> bool {
        let probe = ExecSpec::new(["pgrep", "-f", "claude"]);
        match self.containers.exec(container, &probe).await {
            Ok(out) => out.exit_code == 0,
            Err(e) => {
                debug!(container = %container, error = %e, "busy probe failed");
                false
            }
        }
    }

    async fn version(&self, container: &str) -> Result<String> {
        let probe = ExecSpec::new(["claude", "--version"]);
        let out = self.containers.exec(container, &probe).await?;
        if out.success() {
            Ok(out.stdout.trim().to_string())
        } else if missing_binary(&out) {
            Err(BackendError::NotInstalled(container.to_string()))
        } else {
            Err(BackendError::NotReady(format!(
                "claude --version failed: {}",
                out.stderr.trim()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tk_sandbox::container::{
        ContainerError, ContainerHealth, ContainerSpec, ContainerUsage, ExecStream,
    };

    use super::*;

    #[test]
    fn command_carries_base_flags() {
        let cmd = ClaudeRunner::build_command("fix the tests", &RunOptions::new());
        assert_eq!(cmd[0], "claude");
        assert_eq!(cmd[1], "-p");
        assert_eq!(cmd[2], "fix the tests");
        assert!(cmd.contains(&"--output-format".to_string()));
        assert!(cmd.contains(&"stream-json".to_string()));
        assert!(cmd.contains(&"--verbose".to_string()));
        assert!(cmd.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!cmd.contains(&"--model".to_string()));
    }

    #[test]
    fn command_joins_tool_lists() {
        let opts = RunOptions::new()
            .with_model("sonnet")
            .with_max_turns(12)
            .with_allowed_tools(vec!["Bash".to_string(), "Read".to_string()])
            .with_disallowed_tools(vec!["WebSearch".to_string()])
            .with_system_prompt("stay in the worktree");
        let cmd = ClaudeRunner::build_command("prompt", &opts);
        let joined = cmd.join(" ");
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--max-turns 12"));
        assert!(joined.contains("--allowedTools Bash,Read"));
        assert!(joined.contains("--disallowedTools WebSearch"));
        assert!(joined.contains("--append-system-prompt stay in the worktree"));
    }

    #[test]
    fn missing_binary_classification() {
        assert!(missing_binary_text(
            "OCI runtime exec failed: exec failed: unable to start container process: \
             exec: \"claude\": executable file not found in $PATH: unknown"
        ));
        assert!(missing_binary_text("sh: claude: command not found"));
        assert!(missing_binary_text("/bin/sh: claude: not found"));
        assert!(!missing_binary_text("Error: prompt is required"));
    }

    // -----------------------------------------------------------------------
    // Scripted container fake
    // -----------------------------------------------------------------------

    struct ScriptedContainers {
        running: bool,
        exec_outputs: Mutex<VecDeque<ExecOutput>>,
        commands: Mutex<Vec<Vec<String>>>,
        stream_chunks: Vec<Vec<u8>>,
        stream_exit: i32,
    }

    impl ScriptedContainers {
        fn new(outputs: Vec<ExecOutput>) -> Self {
            Self {
                running: true,
                exec_outputs: Mutex::new(outputs.into()),
                commands: Mutex::new(Vec::new()),
                stream_chunks: Vec::new(),
                stream_exit: 0,
            }
        }

        fn with_stream(mut self, chunks: Vec<Vec<u8>>, exit: i32) -> Self {
            self.stream_chunks = chunks;
            self.stream_exit = exit;
            self
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }
    }

    fn ok_output(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn err_output(code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait::async_trait]
    impl ContainerControl for ScriptedContainers {
        async fn ensure_network(&self, _name: &str) -> tk_sandbox::container::Result<()> {
            Ok(())
        }
        async fn create(&self, _spec: &ContainerSpec) -> tk_sandbox::container::Result<()> {
            Ok(())
        }
        async fn start(&self, _name: &str) -> tk_sandbox::container::Result<()> {
            Ok(())
        }
        async fn stop(&self, _name: &str) -> tk_sandbox::container::Result<()> {
            Ok(())
        }
        async fn remove(&self, _name: &str, _force: bool) -> tk_sandbox::container::Result<()> {
            Ok(())
        }
        async fn exists(&self, _name: &str) -> tk_sandbox::container::Result<bool> {
            Ok(true)
        }
        async fn is_running(&self, _name: &str) -> tk_sandbox::container::Result<bool> {
            Ok(self.running)
        }
        async fn inspect(&self, name: &str) -> tk_sandbox::container::Result<ContainerHealth> {
            Err(ContainerError::NotFound(name.to_string()))
        }
        async fn usage(&self, name: &str) -> tk_sandbox::container::Result<ContainerUsage> {
            Err(ContainerError::NotFound(name.to_string()))
        }
        async fn exec(
            &self,
            _name: &str,
            spec: &ExecSpec,
        ) -> tk_sandbox::container::Result<ExecOutput> {
            self.commands.lock().unwrap().push(spec.cmd.clone());
            Ok(self
                .exec_outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok_output("")))
        }
        async fn exec_stream(
            &self,
            _name: &str,
            spec: &ExecSpec,
        ) -> tk_sandbox::container::Result<ExecStream> {
            self.commands.lock().unwrap().push(spec.cmd.clone());
            let (tx, rx) = flume::bounded(8);
            let chunks = self.stream_chunks.clone();
            let exit = self.stream_exit;
            let handle = tokio::spawn(async move {
                for chunk in chunks {
                    let _ = tx.send_async(chunk).await;
                }
                Ok(exit)
            });
            Ok(ExecStream::new(rx, handle))
        }
    }

    #[tokio::test]
    async fn run_extracts_session_and_exit() {
        let stdout = "{\"type\":\"system\",\"session_id\":\"sess-42\"}\n{\"type\":\"result\"}\n";
        let containers = Arc::new(ScriptedContainers::new(vec![ok_output(stdout)]));
        let runner = ClaudeRunner::new(containers.clone());

        let result = runner
            .run("tanuki-demo", "do the thing", &RunOptions::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.session_id.as_deref(), Some("sess-42"));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(containers.commands()[0][0], "claude");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_as_result_error() {
        let containers = Arc::new(ScriptedContainers::new(vec![err_output(
            1,
            "Error: prompt rejected",
        )]));
        let runner = ClaudeRunner::new(containers);

        let result = runner
            .run("tanuki-demo", "prompt", &RunOptions::new())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.error.as_deref(), Some("Error: prompt rejected"));
    }

    #[tokio::test]
    async fn run_classifies_missing_binary() {
        let containers = Arc::new(ScriptedContainers::new(vec![err_output(
            127,
            "sh: claude: command not found",
        )]));
        let runner = ClaudeRunner::new(containers);

        let err = runner
            .run("tanuki-demo", "prompt", &RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn run_follow_forwards_chunks() {
        let chunks = vec![
            b"{\"session_id\":\"sess-7\"}\n".to_vec(),
            b"{\"type\":\"result\"}\n".to_vec(),
        ];
        let containers =
            Arc::new(ScriptedContainers::new(Vec::new()).with_stream(chunks, 0));
        let runner = ClaudeRunner::new(containers);

        let (tx, rx) = flume::unbounded::<Vec<u8>>();
        let result = runner
            .run_follow("tanuki-demo", "prompt", &RunOptions::new(), &tx)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.session_id.as_deref(), Some("sess-7"));
        assert_eq!(rx.drain().count(), 2);
    }

    #[tokio::test]
    async fn ensure_installed_runs_npm_on_miss() {
        let containers = Arc::new(ScriptedContainers::new(vec![
            err_output(127, "sh: claude: command not found"),
            ok_output("installed"),
            ok_output("1.0.24 (Claude Code)"),
        ]));
        let runner = ClaudeRunner::new(containers.clone());

        runner.ensure_installed("tanuki-demo").await.unwrap();

        let commands = containers.commands();
        assert_eq!(commands[0], vec!["claude", "--version"]);
        assert_eq!(
            commands[1],
            vec!["npm", "install", "-g", "@anthropic-ai/claude-code"]
        );
        assert_eq!(commands[2], vec!["claude", "--version"]);
    }

    #[tokio::test]
    async fn ready_rejects_stopped_container() {
        let mut fake = ScriptedContainers::new(Vec::new());
        fake.running = false;
        let runner = ClaudeRunner::new(Arc::new(fake));

        let err = runner.ready("tanuki-demo").await.unwrap_err();
        assert!(matches!(err, BackendError::NotReady(_)));
    }

    #[tokio::test]
    async fn busy_probe_maps_exit_codes() {
        let containers = Arc::new(ScriptedContainers::new(vec![
            ok_output("1234\n"),
            err_output(1, ""),
        ]));
        let runner = ClaudeRunner::new(containers);

        assert!(runner.is_executing("tanuki-demo").await);
        assert!(!runner.is_executing("tanuki-demo").await);
    }
}
