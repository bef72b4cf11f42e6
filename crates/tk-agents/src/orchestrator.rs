use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use tk_core::types::{workstream_branch, AgentStatus};

use crate::manager::{AgentManager, ManagerError, SpawnOptions};
use crate::workstream::{TaskStore, WorkstreamOptions, WorkstreamRunner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("role {role} is at capacity ({limit} active)")]
    RoleAtCapacity { role: String, limit: usize },
    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// WorkstreamOrchestrator
// ---------------------------------------------------------------------------

/// Admits concurrent workstreams under per-role ceilings.
///
/// Each admitted lane gets a deterministic agent (reused across restarts of
/// the same project/workstream pair). Callers run the returned runner and
/// call [`release_workstream`](Self::release_workstream) when it finishes.
pub struct WorkstreamOrchestrator {
    manager: Arc<AgentManager>,
    tasks: Arc<dyn TaskStore>,
    limits: HashMap<String, u32>,
    active: Mutex<HashMap<String, usize>>,
}

impl WorkstreamOrchestrator {
    pub fn new(manager: Arc<AgentManager>, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            manager,
            tasks,
            limits: HashMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of concurrently active workstreams for a role.
    pub fn with_limit(mut self, role: impl Into<String>, limit: u32) -> Self {
        self.limits.insert(role.into(), limit);
        self
    }

    pub fn with_limits(mut self, limits: HashMap<String, u32>) -> Self {
        self.limits = limits;
        self
    }

    /// Effective ceiling for a role. Unset roles get 1.
    pub fn ceiling(&self, role: &str) -> usize {
        ceiling_for(&self.limits, role)
    }

    pub async fn active_count(&self, role: &str) -> usize {
        self.active.lock().await.get(role).copied().unwrap_or(0)
    }

    pub async fn can_start_workstream(&self, role: &str) -> bool {
        self.active_count(role).await < self.ceiling(role)
    }

    /// Admit one workstream for `role` and hand back its configured runner.
    ///
    /// The admission lock is held until the lane's agent is ready, so
    /// concurrent starts against a ceiling of C admit exactly C.
    pub async fn start_workstream(
        &self,
        project: &str,
        workstream: &str,
        role: &str,
    ) -> Result<WorkstreamRunner> {
        let mut active = self.active.lock().await;

        let limit = self.ceiling(role);
        let current = active.get(role).copied().unwrap_or(0);
        if current >= limit {
            return Err(OrchestratorError::RoleAtCapacity {
                role: role.to_string(),
                limit,
            });
        }

        let runner = WorkstreamRunner::new(
            project,
            workstream,
            self.manager.clone(),
            self.tasks.clone(),
        )
        .with_role(role)
        .with_options(WorkstreamOptions::from_config(self.manager.config()));
        let agent_name = runner.agent_name().to_string();

        match self.manager.get(&agent_name) {
            Ok(agent) => {
                debug!(agent = %agent_name, "reusing existing workstream agent");
                if agent.status == AgentStatus::Stopped {
                    self.manager.start(&agent_name).await?;
                }
            }
            Err(ManagerError::NotFound(_)) => {
                let spawn = SpawnOptions::default()
                    .with_branch(workstream_branch(project, workstream))
                    .with_role(role);
                self.manager.spawn(&agent_name, spawn).await?;
            }
            Err(e) => return Err(e.into()),
        }

        *active.entry(role.to_string()).or_insert(0) += 1;
        info!(
            workstream = %workstream,
            role = %role,
            active = current + 1,
            limit,
            "workstream admitted"
        );
        Ok(runner)
    }

    /// Free one slot for `role`. Never drops below zero.
    pub async fn release_workstream(&self, role: &str) {
        let mut active = self.active.lock().await;
        if let Some(count) = active.get_mut(role) {
            *count = count.saturating_sub(1);
        }
        debug!(role = %role, "workstream released");
    }
}

/// Configured limit for a role, clamped so every role can run at least one
/// workstream.
fn ceiling_for(limits: &HashMap<String, u32>, role: &str) -> usize {
    limits.get(role).copied().unwrap_or(1).max(1) as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_defaults_to_one() {
        let limits = HashMap::new();
        assert_eq!(ceiling_for(&limits, "builder"), 1);
    }

    #[test]
    fn zero_limit_clamps_to_one() {
        let mut limits = HashMap::new();
        limits.insert("builder".to_string(), 0);
        assert_eq!(ceiling_for(&limits, "builder"), 1);
    }

    #[test]
    fn configured_limit_applies() {
        let mut limits = HashMap::new();
        limits.insert("builder".to_string(), 3);
        assert_eq!(ceiling_for(&limits, "builder"), 3);
        assert_eq!(ceiling_for(&limits, "reviewer"), 1);
    }
}
