use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime has no container (or network) by this name.
    #[error("container not found: {0}")]
    NotFound(String),
    /// A runtime command failed. `stderr` carries the runtime's explanation.
    #[error("container runtime {context} failed: {stderr}")]
    Runtime { context: String, stderr: String },
    #[error("failed to invoke container runtime: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("unexpected runtime output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

// ---------------------------------------------------------------------------
// ContainerSpec
// ---------------------------------------------------------------------------

/// Bind mount from host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
}

/// Everything needed to create an agent container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub workdir: String,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network: String::new(),
            workdir: "/workspace".to_string(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_mount(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Health and usage
// ---------------------------------------------------------------------------

/// Point-in-time view of a container, as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHealth {
    /// Truncated runtime id (12 chars).
    pub short_id: String,
    pub image: String,
    pub running: bool,
    /// Filled from [`ContainerControl::usage`] when the container is running.
    pub cpu_percent: Option<String>,
    pub memory: Option<String>,
}

/// Live resource usage strings, formatted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub cpu_percent: String,
    pub memory: String,
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// A command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
}

impl ExecSpec {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Captured result of a completed exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr interleaved the way a terminal would show them.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// A live exec: output chunks arrive on `chunks` while the command runs;
/// `wait` resolves to the exit code once the channel drains.
pub struct ExecStream {
    pub id: Uuid,
    pub chunks: flume::Receiver<Vec<u8>>,
    completion: tokio::task::JoinHandle<Result<i32>>,
}

impl ExecStream {
    pub fn new(
        chunks: flume::Receiver<Vec<u8>>,
        completion: tokio::task::JoinHandle<Result<i32>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chunks,
            completion,
        }
    }

    /// Handle that aborts the waiter, tearing down the exec process.
    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.completion.abort_handle()
    }

    /// Wait for the command to finish and return its exit code.
    ///
    /// Callers normally drain `chunks` first; the channel disconnects when
    /// the command's output is exhausted.
    pub async fn wait(self) -> Result<i32> {
        match self.completion.await {
            Ok(result) => result,
            Err(e) => Err(ContainerError::Runtime {
                context: "exec stream".to_string(),
                stderr: e.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerControl
// ---------------------------------------------------------------------------

/// Capability seam for the container runtime.
///
/// The lifecycle manager and execution backend talk to this trait only;
/// production code wires in [`crate::docker::DockerCli`]. Every method maps
/// to one runtime operation so fakes stay trivial to write.
#[async_trait::async_trait]
pub trait ContainerControl: Send + Sync {
    /// Create the named network if it does not exist yet.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Create a container from a spec. The container is not started.
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Whether a container by this name exists at all (running or not).
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn inspect(&self, name: &str) -> Result<ContainerHealth>;

    /// Live CPU/memory usage. Only meaningful for running containers.
    async fn usage(&self, name: &str) -> Result<ContainerUsage>;

    /// Run a command to completion, capturing output.
    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput>;

    /// Run a command with live output streaming.
    async fn exec_stream(&self, name: &str, spec: &ExecSpec) -> Result<ExecStream>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
