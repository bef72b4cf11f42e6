use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::container::{
    ContainerControl, ContainerError, ContainerHealth, ContainerSpec, ContainerUsage, ExecOutput,
    ExecSpec, ExecStream, Result,
};

// ---------------------------------------------------------------------------
// DockerCli
// ---------------------------------------------------------------------------

/// Container control over the `docker` binary.
///
/// Containers are created with a `sleep infinity` keep-alive so they idle
/// until the engine execs commands into them. All state parsing goes through
/// `docker inspect`/`docker stats` JSON output.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different binary, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run and require success, classifying missing containers.
    async fn run_checked(&self, context: &str, name: &str, args: &[String]) -> Result<ExecOutput> {
        let out = self.run(args).await?;
        if out.success() {
            Ok(out)
        } else if not_found(&out.stderr) {
            Err(ContainerError::NotFound(name.to_string()))
        } else {
            Err(ContainerError::Runtime {
                context: context.to_string(),
                stderr: out.stderr,
            })
        }
    }

    fn build_create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        if !spec.network.is_empty() {
            args.push("--network".to_string());
            args.push(spec.network.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.source, mount.target));
        }
        if !spec.workdir.is_empty() {
            args.push("-w".to_string());
            args.push(spec.workdir.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        // Keep-alive: the container idles until commands are exec'd into it.
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }

    fn build_exec_args(name: &str, spec: &ExecSpec) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(dir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }
        args.push(name.to_string());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait::async_trait]
impl ContainerControl for DockerCli {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        let probe = self.run(&strings(&["network", "inspect", name])).await?;
        if probe.success() {
            return Ok(());
        }
        debug!(network = %name, "creating container network");
        let created = self.run(&strings(&["network", "create", name])).await?;
        if created.success() {
            Ok(())
        } else {
            Err(ContainerError::Runtime {
                context: "network create".to_string(),
                stderr: created.stderr,
            })
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        info!(container = %spec.name, image = %spec.image, "creating container");
        let args = Self::build_create_args(spec);
        self.run_checked("create", &spec.name, &args).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        debug!(container = %name, "starting container");
        self.run_checked("start", name, &strings(&["start", name]))
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        debug!(container = %name, "stopping container");
        self.run_checked("stop", name, &strings(&["stop", name]))
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        info!(container = %name, "removing container");
        let args = if force {
            strings(&["rm", "-f", name])
        } else {
            strings(&["rm", name])
        };
        self.run_checked("rm", name, &args).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let out = self
            .run(&strings(&["inspect", "--format", "{{.Id}}", name]))
            .await?;
        if out.success() {
            Ok(true)
        } else if not_found(&out.stderr) {
            Ok(false)
        } else {
            Err(ContainerError::Runtime {
                context: "inspect".to_string(),
                stderr: out.stderr,
            })
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .run_checked(
                "inspect",
                name,
                &strings(&["inspect", "--format", "{{.State.Running}}", name]),
            )
            .await?;
        Ok(out.stdout.trim() == "true")
    }

    async fn inspect(&self, name: &str) -> Result<ContainerHealth> {
        let out = self
            .run_checked("inspect", name, &strings(&["inspect", name]))
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out.stdout)
            .map_err(|e| ContainerError::Parse(e.to_string()))?;
        let obj = value
            .as_array()
            .and_then(|entries| entries.first())
            .ok_or_else(|| ContainerError::Parse("empty inspect result".to_string()))?;

        let id = obj.get("Id").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(ContainerHealth {
            short_id: id.chars().take(12).collect(),
            image: obj
                .pointer("/Config/Image")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            running: obj
                .pointer("/State/Running")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            cpu_percent: None,
            memory: None,
        })
    }

    async fn usage(&self, name: &str) -> Result<ContainerUsage> {
        let out = self
            .run_checked(
                "stats",
                name,
                &strings(&["stats", "--no-stream", "--format", "{{json .}}", name]),
            )
            .await?;
        let line = out
            .stdout
            .lines()
            .next()
            .ok_or_else(|| ContainerError::Parse("empty stats output".to_string()))?;
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| ContainerError::Parse(e.to_string()))?;

        let field = |key: &str| -> Result<String> {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| ContainerError::Parse(format!("stats output missing {key}")))
        };
        Ok(ContainerUsage {
            cpu_percent: field("CPUPerc")?,
            memory: field("MemUsage")?,
        })
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        let args = Self::build_exec_args(name, spec);
        let out = self.run(&args).await?;
        // A non-zero exit from the inner command is a valid result; only
        // docker-level failures become errors.
        if not_found(&out.stderr) {
            return Err(ContainerError::NotFound(name.to_string()));
        }
        if out.stderr.contains("is not running") {
            return Err(ContainerError::Runtime {
                context: "exec".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    async fn exec_stream(&self, name: &str, spec: &ExecSpec) -> Result<ExecStream> {
        let args = Self::build_exec_args(name, spec);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ContainerError::Parse("child stdout unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ContainerError::Parse("child stderr unavailable".to_string())
        })?;

        let (tx, rx) = flume::bounded(256);
        let err_tx = tx.clone();
        let out_pump = tokio::spawn(pump(stdout, tx));
        let err_pump = tokio::spawn(pump(stderr, err_tx));

        let completion = tokio::spawn(async move {
            let _ = tokio::join!(out_pump, err_pump);
            let status = child.wait().await.map_err(ContainerError::Spawn)?;
            Ok(status.code().unwrap_or(-1))
        });

        Ok(ExecStream::new(rx, completion))
    }
}

/// Forward raw output chunks into the stream channel until EOF.
async fn pump<R>(mut reader: R, tx: flume::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send_async(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
