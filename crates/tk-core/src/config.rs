use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.tanuki/config.toml`.
///
/// Every section falls back to defaults when absent, so an empty file (or no
/// file at all) yields a fully usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ralph: RalphConfig,
    #[serde(default)]
    pub workstream: WorkstreamConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load config from `~/.tanuki/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agent.validate()?;
        self.ralph.validate()?;
        self.workstream.validate()?;
        self.sandbox.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tanuki")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

/// Defaults applied to a run when the caller leaves an option unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default = "default_allowed_tools")]
    pub default_allowed_tools: Vec<String>,
    #[serde(default)]
    pub default_disallowed_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_max_turns: default_max_turns(),
            default_allowed_tools: default_allowed_tools(),
            default_disallowed_tools: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_turns == 0 {
            return Err(ConfigError::Validation(
                "agent.default_max_turns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_model() -> String {
    "sonnet".into()
}
fn default_max_turns() -> u32 {
    30
}
fn default_allowed_tools() -> Vec<String> {
    ["Bash", "Read", "Write", "Edit", "Grep", "Glob"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Autonomous-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    #[serde(default = "default_ralph_iterations")]
    pub max_iterations: u32,
    /// Marker the agent prints when it considers the work done.
    #[serde(default = "default_completion_signal")]
    pub completion_signal: String,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_ralph_iterations(),
            completion_signal: default_completion_signal(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl RalphConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "ralph.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.completion_signal.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ralph.completion_signal must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_ralph_iterations() -> u32 {
    30
}
fn default_completion_signal() -> String {
    "DONE".into()
}
fn default_cooldown_secs() -> u64 {
    5
}

/// Workstream polling and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkstreamConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on how long a task may sit blocked before the stream
    /// gives up on it.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_true")]
    pub follow: bool,
}

impl Default for WorkstreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            follow: true,
        }
    }
}

impl WorkstreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "workstream.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}
fn default_max_wait_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Mount point of the agent worktree inside the container.
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: default_network(),
            workdir: default_workdir(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sandbox.image must not be empty".to_string(),
            ));
        }
        if self.network.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sandbox.network must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_image() -> String {
    "tanuki-sandbox:latest".into()
}
fn default_network() -> String {
    "tanuki".into()
}
fn default_workdir() -> String {
    "/workspace".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Fleet state file. One JSON document for the whole fleet.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Worktree directory, relative to the repository root.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            worktree_dir: default_worktree_dir(),
        }
    }
}

fn default_state_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tanuki")
        .join("state.json")
}
fn default_worktree_dir() -> PathBuf {
    PathBuf::from(".tanuki").join("worktrees")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agent.default_model, "sonnet");
        assert_eq!(cfg.ralph.max_iterations, 30);
        assert_eq!(cfg.ralph.completion_signal, "DONE");
        assert_eq!(cfg.ralph.cooldown(), Duration::from_secs(5));
        assert_eq!(cfg.workstream.poll_interval(), Duration::from_secs(10));
        assert!(cfg.workstream.follow);
    }

    #[test]
    fn empty_toml_loads_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.sandbox.image, "tanuki-sandbox:latest");
        assert_eq!(cfg.sandbox.workdir, "/workspace");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [ralph]
            max_iterations = 5

            [agent]
            default_model = "opus"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ralph.max_iterations, 5);
        assert_eq!(cfg.ralph.completion_signal, "DONE");
        assert_eq!(cfg.agent.default_model, "opus");
        assert_eq!(cfg.agent.default_max_turns, 30);
    }

    #[test]
    fn zero_iterations_rejected() {
        let cfg: Config = toml::from_str("[ralph]\nmax_iterations = 0\n").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Validation(msg)) if msg.contains("max_iterations")
        ));
    }

    #[test]
    fn blank_signal_rejected() {
        let cfg: Config = toml::from_str("[ralph]\ncompletion_signal = \"  \"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::default();
        std::fs::write(&path, cfg.to_toml().unwrap()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.agent.default_model, cfg.agent.default_model);
        assert_eq!(loaded.workstream.max_wait_secs, cfg.workstream.max_wait_secs);
    }
}
