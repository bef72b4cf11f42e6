use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Branch namespace for agent worktrees.
pub const BRANCH_PREFIX: &str = "tanuki/";

/// Container name namespace.
pub const CONTAINER_PREFIX: &str = "tanuki-";

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Stopped,
    Error,
}

impl AgentStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Error` is reachable from any state: reconciliation marks an agent
    /// errored whenever its container has vanished, regardless of what the
    /// record said before.
    pub fn can_transition_to(&self, target: &AgentStatus) -> bool {
        if *target == AgentStatus::Error {
            return true;
        }
        matches!(
            (self, target),
            (AgentStatus::Idle, AgentStatus::Working)
                | (AgentStatus::Working, AgentStatus::Idle)
                | (AgentStatus::Idle, AgentStatus::Stopped)
                | (AgentStatus::Working, AgentStatus::Stopped)
                | (AgentStatus::Stopped, AgentStatus::Idle)
                | (AgentStatus::Error, AgentStatus::Idle)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// TaskInfo
// ---------------------------------------------------------------------------

/// Record of the most recent execution routed through an agent.
///
/// Replaced wholesale at the start of each run; completion time and session
/// id are filled in once the run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
}

impl TaskInfo {
    pub fn started(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            started_at: Utc::now(),
            completed_at: None,
            session_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Persisted record of one agent: the durable leg of the
/// (worktree, container, record) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    /// Container name, derived from the agent name.
    pub container: String,
    /// Git branch backing the agent's worktree.
    pub branch: String,
    /// Filesystem path of the agent's worktree.
    pub worktree: PathBuf,
    pub status: AgentStatus,
    pub role: Option<String>,
    /// Tool allow-list captured from the role at spawn time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task: Option<TaskInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        branch: impl Into<String>,
        worktree: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            container: container_name(&name),
            name,
            branch: branch.into(),
            worktree: worktree.into(),
            status: AgentStatus::Idle,
            role: None,
            allowed_tools: None,
            disallowed_tools: None,
            last_task: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_working(&self) -> bool {
        self.status == AgentStatus::Working
    }

    /// Set a new status and refresh `updated_at`.
    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// GitChanges
// ---------------------------------------------------------------------------

/// Snapshot of a worktree's divergence from its base branch.
///
/// Both fields degrade to empty strings when git cannot answer, which reads
/// as "no changes" downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChanges {
    /// `git diff --stat` output against the base branch.
    pub diff: String,
    /// `git status --porcelain` output inside the worktree.
    pub status: String,
}

impl GitChanges {
    pub fn has_changes(&self) -> bool {
        !self.diff.trim().is_empty() || !self.status.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Agent naming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid agent name {name:?}: {reason}")]
pub struct InvalidNameError {
    pub name: String,
    pub reason: &'static str,
}

impl InvalidNameError {
    fn new(name: &str, reason: &'static str) -> Self {
        Self {
            name: name.to_string(),
            reason,
        }
    }
}

/// Validate an agent name.
///
/// Names are 2-63 characters, start with a lowercase letter, end with a
/// lowercase letter or digit, and contain only lowercase letters, digits,
/// and hyphens in between. The same rule a DNS label follows, so the name
/// can double as a container name and a branch segment.
pub fn validate_agent_name(name: &str) -> Result<(), InvalidNameError> {
    let len = name.chars().count();
    if len < 2 {
        return Err(InvalidNameError::new(name, "shorter than 2 characters"));
    }
    if len > 63 {
        return Err(InvalidNameError::new(name, "longer than 63 characters"));
    }

    let mut chars = name.chars();
    let first = chars.next().unwrap_or(' ');
    if !first.is_ascii_lowercase() {
        return Err(InvalidNameError::new(
            name,
            "must start with a lowercase letter",
        ));
    }

    let last = name.chars().last().unwrap_or(' ');
    if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
        return Err(InvalidNameError::new(
            name,
            "must end with a lowercase letter or digit",
        ));
    }

    for c in name.chars() {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(InvalidNameError::new(
                name,
                "contains characters outside [a-z0-9-]",
            ));
        }
    }

    Ok(())
}

/// Deterministic agent name for a (project, workstream) pair.
///
/// `{project}-{workstream}`, lowercased, spaces replaced with hyphens. The
/// same pair always maps to the same agent, which is what lets the
/// orchestrator reuse an existing agent instead of spawning a second one.
pub fn workstream_agent_name(project: &str, workstream: &str) -> String {
    format!("{project}-{workstream}")
        .to_lowercase()
        .replace(' ', "-")
}

/// Branch name for a workstream agent: `tanuki/{agent-name}`.
pub fn workstream_branch(project: &str, workstream: &str) -> String {
    format!(
        "{BRANCH_PREFIX}{}",
        workstream_agent_name(project, workstream)
    )
}

/// Container name for an agent: `tanuki-{agent-name}`.
pub fn container_name(agent: &str) -> String {
    format!("{CONTAINER_PREFIX}{agent}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Working).unwrap();
        assert_eq!(json, "\"working\"");
        let back: AgentStatus = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(back, AgentStatus::Stopped);
    }

    #[test]
    fn status_transitions() {
        assert!(AgentStatus::Idle.can_transition_to(&AgentStatus::Working));
        assert!(AgentStatus::Working.can_transition_to(&AgentStatus::Idle));
        assert!(AgentStatus::Stopped.can_transition_to(&AgentStatus::Idle));
        assert!(AgentStatus::Working.can_transition_to(&AgentStatus::Stopped));
        // Error is reachable from anywhere.
        assert!(AgentStatus::Idle.can_transition_to(&AgentStatus::Error));
        assert!(AgentStatus::Stopped.can_transition_to(&AgentStatus::Error));
        // But stopped agents do not jump straight to working.
        assert!(!AgentStatus::Stopped.can_transition_to(&AgentStatus::Working));
    }

    #[test]
    fn valid_names_accepted() {
        for name in ["ab", "agent-1", "proj-backend", "a2", "x-y-z9"] {
            assert!(validate_agent_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_names_rejected() {
        for name in [
            "",
            "a",
            "1agent",
            "-agent",
            "agent-",
            "Agent",
            "agent_x",
            "agent x",
            "été",
        ] {
            assert!(
                validate_agent_name(name).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn name_length_bounds() {
        let max = format!("a{}", "b".repeat(62));
        assert_eq!(max.len(), 63);
        assert!(validate_agent_name(&max).is_ok());
        let too_long = format!("a{}", "b".repeat(63));
        assert!(validate_agent_name(&too_long).is_err());
    }

    #[test]
    fn workstream_naming_is_deterministic() {
        assert_eq!(workstream_agent_name("MyApp", "API Layer"), "myapp-api-layer");
        assert_eq!(
            workstream_branch("MyApp", "API Layer"),
            "tanuki/myapp-api-layer"
        );
        // Derived names pass validation for reasonable inputs.
        assert!(validate_agent_name(&workstream_agent_name("demo", "auth")).is_ok());
    }

    #[test]
    fn container_name_is_prefixed() {
        assert_eq!(container_name("web-api"), "tanuki-web-api");
    }

    #[test]
    fn agent_new_derives_container_and_defaults_idle() {
        let agent = Agent::new("demo-auth", "tanuki/demo-auth", "/tmp/wt/demo-auth");
        assert_eq!(agent.container, "tanuki-demo-auth");
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.last_task.is_none());
    }

    #[test]
    fn agent_round_trips_through_json() {
        let mut agent = Agent::new("demo-auth", "tanuki/demo-auth", "/tmp/wt/demo-auth");
        agent.role = Some("builder".to_string());
        agent.last_task = Some(TaskInfo::started("do the thing"));
        let json = serde_json::to_string(&agent).unwrap();
        let back: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, agent.name);
        assert_eq!(back.status, AgentStatus::Idle);
        assert_eq!(back.role.as_deref(), Some("builder"));
        assert_eq!(back.last_task.unwrap().prompt, "do the thing");
    }
}
