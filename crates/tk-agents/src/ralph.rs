use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tk_core::cancel::CancelToken;
use tk_core::config::Config;
use tk_sandbox::container::{ContainerControl, ExecSpec};

use crate::backend::{BackendError, ExecutionBackend, OutputSink, Result, RunOptions};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Settings for one autonomous loop.
#[derive(Debug, Clone)]
pub struct RalphOptions {
    pub max_iterations: u32,
    /// Marker scanned for in agent output; seeing it ends the loop.
    pub completion_signal: String,
    /// Pause between iterations. Skipped after the final one.
    pub cooldown: Duration,
    /// Optional command run in the container after each iteration; exit code
    /// zero ends the loop.
    pub verify_command: Option<String>,
    pub run: RunOptions,
}

impl Default for RalphOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            completion_signal: "DONE".to_string(),
            cooldown: Duration::from_secs(5),
            verify_command: None,
            run: RunOptions::default(),
        }
    }
}

impl RalphOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_iterations: cfg.ralph.max_iterations,
            completion_signal: cfg.ralph.completion_signal.clone(),
            cooldown: cfg.ralph.cooldown(),
            verify_command: None,
            run: RunOptions::default(),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_verify_command(mut self, cmd: impl Into<String>) -> Self {
        self.verify_command = Some(cmd.into());
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_run(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RalphStopReason {
    /// The completion signal appeared in the output.
    Signal,
    /// The verify command exited zero.
    Verify,
    /// The iteration budget ran out before any completion condition.
    MaxIterations,
    /// A backend error ended the loop early.
    Error,
}

impl std::fmt::Display for RalphStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RalphStopReason::Signal => "signal",
            RalphStopReason::Verify => "verify",
            RalphStopReason::MaxIterations => "max_iterations",
            RalphStopReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphResult {
    pub iterations: u32,
    pub stop_reason: RalphStopReason,
    /// First session id observed across iterations.
    pub session_id: Option<String>,
    pub last_output: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RalphResult {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.stop_reason,
            RalphStopReason::Signal | RalphStopReason::Verify
        )
    }
}

// ---------------------------------------------------------------------------
// RalphLoop
// ---------------------------------------------------------------------------

/// Drives an agent through repeated runs of the same prompt until it signals
/// completion, verification passes, or the budget runs out.
///
/// Running out of budget is not a crash: the result comes back with
/// `stop_reason = MaxIterations` and a sentinel in `error`, with everything
/// gathered so far intact so callers can inspect partial progress.
/// [`RalphResult::succeeded`] is the gate.
pub struct RalphLoop {
    backend: Arc<dyn ExecutionBackend>,
    containers: Arc<dyn ContainerControl>,
    opts: RalphOptions,
}

impl RalphLoop {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        containers: Arc<dyn ContainerControl>,
        opts: RalphOptions,
    ) -> Self {
        Self {
            backend,
            containers,
            opts,
        }
    }

    pub async fn run(
        &self,
        container: &str,
        prompt: &str,
        sink: &dyn OutputSink,
        cancel: &CancelToken,
    ) -> Result<RalphResult> {
        let started_at = Utc::now();
        let mut session_id: Option<String> = None;
        let mut last_output = String::new();
        let mut iterations = 0u32;

        info!(
            container = %container,
            max_iterations = self.opts.max_iterations,
            "starting ralph loop"
        );

        for iteration in 1..=self.opts.max_iterations {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            debug!(container = %container, iteration, "ralph iteration");
            let run_result = tokio::select! {
                res = self.backend.run_follow(container, prompt, &self.opts.run, sink) => res,
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            };
            iterations = iteration;

            let result = match run_result {
                Ok(r) => r,
                Err(e) => {
                    warn!(container = %container, iteration, error = %e, "ralph iteration failed");
                    return Ok(RalphResult {
                        iterations,
                        stop_reason: RalphStopReason::Error,
                        session_id,
                        last_output,
                        started_at,
                        completed_at: Utc::now(),
                        error: Some(e.to_string()),
                    });
                }
            };

            if session_id.is_none() {
                session_id = result.session_id.clone();
            }
            last_output = result.output;

            if last_output.contains(&self.opts.completion_signal) {
                info!(container = %container, iteration, "completion signal observed");
                return Ok(RalphResult {
                    iterations,
                    stop_reason: RalphStopReason::Signal,
                    session_id,
                    last_output,
                    started_at,
                    completed_at: Utc::now(),
                    error: None,
                });
            }

            if let Some(cmd) = &self.opts.verify_command {
                if self.verify(container, cmd).await {
                    info!(container = %container, iteration, "verify command passed");
                    return Ok(RalphResult {
                        iterations,
                        stop_reason: RalphStopReason::Verify,
                        session_id,
                        last_output,
                        started_at,
                        completed_at: Utc::now(),
                        error: None,
                    });
                }
            }

            if iteration < self.opts.max_iterations {
                tokio::select! {
                    _ = tokio::time::sleep(self.opts.cooldown) => {}
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                }
            }
        }

        info!(container = %container, iterations, "ralph budget exhausted");
        Ok(RalphResult {
            iterations,
            stop_reason: RalphStopReason::MaxIterations,
            session_id,
            last_output,
            started_at,
            completed_at: Utc::now(),
            error: Some(format!(
                "max iterations ({}) reached without completion signal",
                self.opts.max_iterations
            )),
        })
    }

    async fn verify(&self, container: &str, cmd: &str) -> bool {
        let spec = ExecSpec::new(["sh", "-c", cmd]);
        match self.containers.exec(container, &spec).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                debug!(container = %container, exit_code = out.exit_code, "verify command failed");
                false
            }
            Err(e) => {
                warn!(container = %container, error = %e, "verify command error");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
