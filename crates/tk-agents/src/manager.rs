use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use tk_core::config::Config;
use tk_core::state::{StateError, StateStore};
use tk_core::types::{
    container_name, validate_agent_name, Agent, AgentStatus, GitChanges, InvalidNameError,
    TaskInfo,
};
use tk_core::worktree::{WorktreeControl, WorktreeError};
use tk_sandbox::container::{ContainerControl, ContainerError, ContainerHealth, ContainerSpec};

use crate::backend::{BackendError, ExecutionBackend, ExecutionResult, OutputSink, RunOptions};
use crate::roles::{render_instructions, stage_context_files, Role, RoleResolver};
use crate::services::{NoServices, ServiceEnvironment};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{0}")]
    InvalidName(#[from] InvalidNameError),
    #[error("agent already exists: {0}")]
    AlreadyExists(String),
    #[error("agent not found: {0}")]
    NotFound(String),
    /// The agent is mid-run; stop it or pass force.
    #[error("agent is working: {0}")]
    AgentWorking(String),
    #[error("unknown role: {0}")]
    RoleNotFound(String),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Branch override; defaults to `tanuki/{name}`.
    pub branch: Option<String>,
    pub role: Option<String>,
    /// Extra container environment. Wins over service-provided keys.
    pub env: BTreeMap<String, String>,
}

impl SpawnOptions {
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Remove even when the agent is marked working.
    pub force: bool,
    /// Leave the branch behind after the worktree goes.
    pub keep_branch: bool,
}

/// Per-run overrides layered over the agent record and config defaults.
#[derive(Clone, Default)]
pub struct RunAgentOptions<'a> {
    /// Sink for live output; `None` runs captured-only.
    pub follow: Option<&'a dyn OutputSink>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Option<Duration>,
}

impl<'a> RunAgentOptions<'a> {
    pub fn with_follow(mut self, sink: &'a dyn OutputSink) -> Self {
        self.follow = Some(sink);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Aggregated live view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusReport {
    pub agent: Agent,
    /// `None` when the container cannot be inspected.
    pub container: Option<ContainerHealth>,
    pub changes: GitChanges,
}

/// Counts from one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub marked_error: usize,
    pub marked_stopped: usize,
}

// ---------------------------------------------------------------------------
// Provisioning rollback
// ---------------------------------------------------------------------------

/// Spawn steps completed so far, unwound in reverse when a later step fails.
enum ProvisionStep {
    Worktree { name: String },
    ContainerCreated { container: String },
    ContainerStarted { container: String },
}

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// Lifecycle manager for the agent fleet.
///
/// Each agent is the triple (git worktree, container, persisted record).
/// The manager provisions and tears down all three together, keeps the
/// persisted record in sync with what it observes, and routes execution
/// through the backend. Records are re-read from the store on every
/// operation; nothing is cached across calls.
pub struct AgentManager {
    store: Arc<dyn StateStore>,
    worktrees: Arc<dyn WorktreeControl>,
    containers: Arc<dyn ContainerControl>,
    backend: Arc<dyn ExecutionBackend>,
    roles: Option<Arc<dyn RoleResolver>>,
    services: Arc<dyn ServiceEnvironment>,
    config: Config,
    repo_root: PathBuf,
    /// Serializes the working check-and-set in `run`.
    run_guard: tokio::sync::Mutex<()>,
}

impl AgentManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        worktrees: Arc<dyn WorktreeControl>,
        containers: Arc<dyn ContainerControl>,
        backend: Arc<dyn ExecutionBackend>,
        config: Config,
    ) -> Self {
        Self {
            store,
            worktrees,
            containers,
            backend,
            roles: None,
            services: Arc::new(NoServices),
            config,
            repo_root: PathBuf::from("."),
            run_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleResolver>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceEnvironment>) -> Self {
        self.services = services;
        self
    }

    /// Repository root that role context patterns resolve against.
    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = repo_root.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Spawn
    // -----------------------------------------------------------------------

    /// Provision a new agent: worktree, container, persisted record.
    ///
    /// Provisioning is atomic: when any step fails, everything already
    /// created is torn down in reverse order and the original error comes
    /// back. A failed spawn leaves no trace.
    pub async fn spawn(&self, name: &str, opts: SpawnOptions) -> Result<Agent> {
        validate_agent_name(name)?;

        if self.store.get_agent(name)?.is_some() {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }

        // Resolve the role before provisioning so a bad name fails clean.
        let role = match &opts.role {
            Some(role_name) => Some(self.resolve_role(role_name)?),
            None => None,
        };

        info!(agent = %name, role = ?opts.role, "spawning agent");

        let mut steps: Vec<ProvisionStep> = Vec::new();
        match self.provision(name, &opts, role.as_ref(), &mut steps).await {
            Ok(agent) => {
                info!(
                    agent = %name,
                    container = %agent.container,
                    branch = %agent.branch,
                    "agent spawned"
                );
                Ok(agent)
            }
            Err(e) => {
                warn!(agent = %name, error = %e, "spawn failed, rolling back");
                self.rollback(steps).await;
                Err(e)
            }
        }
    }

    fn resolve_role(&self, role_name: &str) -> Result<Role> {
        self.roles
            .as_ref()
            .and_then(|resolver| resolver.resolve(role_name))
            .ok_or_else(|| ManagerError::RoleNotFound(role_name.to_string()))
    }

    async fn provision(
        &self,
        name: &str,
        opts: &SpawnOptions,
        role: Option<&Role>,
        steps: &mut Vec<ProvisionStep>,
    ) -> Result<Agent> {
        let info = self.worktrees.create(name, opts.branch.as_deref())?;
        steps.push(ProvisionStep::Worktree {
            name: name.to_string(),
        });

        // Role context goes into the worktree before the container mounts it.
        if let Some(role) = role {
            let staged = stage_context_files(&self.repo_root, &info.path, &role.context_patterns);
            debug!(agent = %name, staged = staged.len(), "staged role context");
            let docs = self.services.docs();
            let body = render_instructions(role, &staged, docs.as_deref());
            std::fs::write(info.path.join("CLAUDE.md"), body)
                .map_err(|e| ManagerError::Worktree(WorktreeError::Io(e)))?;
        }

        let mut env = self.services.env_map();
        env.extend(opts.env.clone());
        for warning in self.services.health_warnings() {
            warn!(agent = %name, warning = %warning, "service health warning");
        }

        let container = container_name(name);
        let mut spec = ContainerSpec::new(container.clone(), self.config.sandbox.image.clone())
            .with_network(self.config.sandbox.network.clone())
            .with_workdir(self.config.sandbox.workdir.clone())
            .with_mount(
                info.path.display().to_string(),
                self.config.sandbox.workdir.clone(),
            )
            .with_label("tanuki.agent", name);
        for (key, value) in env {
            spec = spec.with_env(key, value);
        }

        self.containers
            .ensure_network(&self.config.sandbox.network)
            .await?;
        self.containers.create(&spec).await?;
        steps.push(ProvisionStep::ContainerCreated {
            container: container.clone(),
        });

        self.containers.start(&container).await?;
        steps.push(ProvisionStep::ContainerStarted {
            container: container.clone(),
        });

        self.backend.ensure_installed(&container).await?;

        let mut agent = Agent::new(name, info.branch.clone(), info.path.clone());
        agent.role = role.map(|r| r.name.clone());
        agent.allowed_tools = role.and_then(|r| r.allowed_tools.clone());
        agent.disallowed_tools = role.and_then(|r| r.disallowed_tools.clone());
        self.store.put_agent(&agent)?;

        Ok(agent)
    }

    async fn rollback(&self, steps: Vec<ProvisionStep>) {
        for step in steps.into_iter().rev() {
            match step {
                ProvisionStep::ContainerStarted { container } => {
                    if let Err(e) = self.containers.stop(&container).await {
                        warn!(container = %container, error = %e, "rollback stop failed");
                    }
                }
                ProvisionStep::ContainerCreated { container } => {
                    if let Err(e) = self.containers.remove(&container, true).await {
                        warn!(container = %container, error = %e, "rollback remove failed");
                    }
                }
                ProvisionStep::Worktree { name } => {
                    if let Err(e) = self.worktrees.remove(&name, false) {
                        warn!(worktree = %name, error = %e, "rollback worktree removal failed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown and state transitions
    // -----------------------------------------------------------------------

    /// Tear an agent down: container, worktree, record.
    ///
    /// The record always goes, even when the worktree refuses to: a git
    /// failure is surfaced after the record is deleted so the fleet never
    /// keeps a record pointing at resources the caller asked to destroy.
    pub async fn remove(&self, name: &str, opts: RemoveOptions) -> Result<()> {
        let agent = self.require(name)?;

        if agent.is_working() && !opts.force {
            return Err(ManagerError::AgentWorking(name.to_string()));
        }

        info!(agent = %name, force = opts.force, "removing agent");

        if let Err(e) = self.containers.stop(&agent.container).await {
            debug!(agent = %name, error = %e, "container stop during remove failed");
        }
        if let Err(e) = self.containers.remove(&agent.container, true).await {
            match e {
                ContainerError::NotFound(_) => {}
                other => warn!(agent = %name, error = %other, "container remove failed"),
            }
        }

        let worktree_result = self.worktrees.remove(name, opts.keep_branch);

        self.store.remove_agent(name)?;
        info!(agent = %name, "agent removed");

        worktree_result.map_err(ManagerError::from)
    }

    /// Stop the agent's container and mark it stopped.
    pub async fn stop(&self, name: &str) -> Result<Agent> {
        let mut agent = self.require(name)?;
        self.containers.stop(&agent.container).await?;
        agent.set_status(AgentStatus::Stopped);
        self.store.put_agent(&agent)?;
        info!(agent = %name, "agent stopped");
        Ok(agent)
    }

    /// Start the agent's container and mark it idle.
    pub async fn start(&self, name: &str) -> Result<Agent> {
        let mut agent = self.require(name)?;
        self.containers.start(&agent.container).await?;
        agent.set_status(AgentStatus::Idle);
        self.store.put_agent(&agent)?;
        info!(agent = %name, "agent started");
        Ok(agent)
    }

    pub fn get(&self, name: &str) -> Result<Agent> {
        self.require(name)
    }

    pub fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents()?)
    }

    pub fn is_working(&self, name: &str) -> Result<bool> {
        Ok(self.require(name)?.is_working())
    }

    fn require(&self, name: &str) -> Result<Agent> {
        self.store
            .get_agent(name)?
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Record plus live container health and git changes.
    ///
    /// Probe failures degrade instead of erroring: a missing container reads
    /// as `None`, git trouble reads as no changes.
    pub async fn status(&self, name: &str) -> Result<AgentStatusReport> {
        let agent = self.require(name)?;

        let container = match self.containers.inspect(&agent.container).await {
            Ok(mut health) => {
                if health.running {
                    match self.containers.usage(&agent.container).await {
                        Ok(usage) => {
                            health.cpu_percent = Some(usage.cpu_percent);
                            health.memory = Some(usage.memory);
                        }
                        Err(e) => {
                            debug!(agent = %name, error = %e, "usage probe failed");
                        }
                    }
                }
                Some(health)
            }
            Err(e) => {
                debug!(agent = %name, error = %e, "container inspect failed");
                None
            }
        };

        let changes = GitChanges {
            diff: self.worktrees.diff(name).unwrap_or_default(),
            status: self.worktrees.status(name).unwrap_or_default(),
        };

        Ok(AgentStatusReport {
            agent,
            container,
            changes,
        })
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Execute one prompt through the agent.
    ///
    /// Exactly one run per agent at a time: a second concurrent call fails
    /// with `AgentWorking`. The agent always lands back on `idle` afterwards,
    /// with `last_task` recording what ran.
    pub async fn run(
        &self,
        name: &str,
        prompt: &str,
        opts: RunAgentOptions<'_>,
    ) -> Result<ExecutionResult> {
        let mut agent = {
            let _guard = self.run_guard.lock().await;
            let mut agent = self.require(name)?;
            if agent.is_working() {
                return Err(ManagerError::AgentWorking(name.to_string()));
            }
            self.backend.ready(&agent.container).await?;

            agent.set_status(AgentStatus::Working);
            agent.last_task = Some(TaskInfo::started(prompt));
            self.store.put_agent(&agent)?;
            agent
        };

        info!(agent = %name, "running agent");
        let run_opts = merged_run_options(&self.config, &agent, &opts);

        let exec_result = match opts.follow {
            Some(sink) => {
                self.backend
                    .run_follow(&agent.container, prompt, &run_opts, sink)
                    .await
            }
            None => self.backend.run(&agent.container, prompt, &run_opts).await,
        };

        agent.set_status(AgentStatus::Idle);
        if let Ok(result) = &exec_result {
            if let Some(task) = agent.last_task.as_mut() {
                task.completed_at = Some(result.completed_at);
                task.session_id = result.session_id.clone();
            }
        }
        if let Err(e) = self.store.put_agent(&agent) {
            // The stored status now lies about the agent; that beats losing
            // the run outcome silently, so report the state failure first.
            warn!(agent = %name, error = %e, "failed to reset agent after run");
            return Err(e.into());
        }

        let result = exec_result?;
        match &result.error {
            Some(err) => warn!(agent = %name, error = %err, "run finished with error"),
            None => info!(agent = %name, session = ?result.session_id, "run complete"),
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Reconcile
    // -----------------------------------------------------------------------

    /// Sweep the fleet and realign records with observed container state.
    ///
    /// A vanished container marks the agent errored; a stopped container
    /// under a working agent marks it stopped. Probe and save failures skip
    /// that agent, never the sweep. Running it twice changes nothing the
    /// second time.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let agents = self.store.list_agents()?;
        let mut report = ReconcileReport::default();

        for mut agent in agents {
            report.checked += 1;

            let exists = match self.containers.exists(&agent.container).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(agent = %agent.name, error = %e, "reconcile probe failed");
                    continue;
                }
            };

            if !exists {
                if agent.status != AgentStatus::Error {
                    warn!(
                        agent = %agent.name,
                        container = %agent.container,
                        "container missing, marking agent errored"
                    );
                    agent.set_status(AgentStatus::Error);
                    if self.persist_best_effort(&agent) {
                        report.marked_error += 1;
                    }
                }
                continue;
            }

            if agent.status == AgentStatus::Working {
                let running = match self.containers.is_running(&agent.container).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(agent = %agent.name, error = %e, "reconcile probe failed");
                        continue;
                    }
                };
                if !running {
                    warn!(
                        agent = %agent.name,
                        "container stopped while agent marked working"
                    );
                    agent.set_status(AgentStatus::Stopped);
                    if self.persist_best_effort(&agent) {
                        report.marked_stopped += 1;
                    }
                }
            }
        }

        info!(
            checked = report.checked,
            marked_error = report.marked_error,
            marked_stopped = report.marked_stopped,
            "reconcile complete"
        );
        Ok(report)
    }

    fn persist_best_effort(&self, agent: &Agent) -> bool {
        match self.store.put_agent(agent) {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "failed to persist agent record");
                false
            }
        }
    }
}

/// Layer run options: caller overrides, then the agent record's role capture,
/// then config defaults.
fn merged_run_options(cfg: &Config, agent: &Agent, opts: &RunAgentOptions<'_>) -> RunOptions {
    let default_disallowed = if cfg.agent.default_disallowed_tools.is_empty() {
        None
    } else {
        Some(cfg.agent.default_disallowed_tools.clone())
    };
    RunOptions {
        model: opts
            .model
            .clone()
            .or_else(|| Some(cfg.agent.default_model.clone())),
        max_turns: opts.max_turns.or(Some(cfg.agent.default_max_turns)),
        allowed_tools: agent
            .allowed_tools
            .clone()
            .or_else(|| Some(cfg.agent.default_allowed_tools.clone())),
        disallowed_tools: agent.disallowed_tools.clone().or(default_disallowed),
        system_prompt: None,
        timeout: opts.timeout,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_tools() -> Agent {
        let mut agent = Agent::new("demo-auth", "tanuki/demo-auth", "/tmp/wt");
        agent.allowed_tools = Some(vec!["Read".to_string(), "Grep".to_string()]);
        agent
    }

    #[test]
    fn run_options_fall_back_to_config_defaults() {
        let cfg = Config::default();
        let agent = Agent::new("demo-auth", "tanuki/demo-auth", "/tmp/wt");

        let merged = merged_run_options(&cfg, &agent, &RunAgentOptions::default());
        assert_eq!(merged.model.as_deref(), Some("sonnet"));
        assert_eq!(merged.max_turns, Some(30));
        assert_eq!(
            merged.allowed_tools.as_ref().map(Vec::len),
            Some(cfg.agent.default_allowed_tools.len())
        );
        assert!(merged.disallowed_tools.is_none());
    }

    #[test]
    fn caller_overrides_win_over_defaults() {
        let cfg = Config::default();
        let agent = agent_with_tools();
        let opts = RunAgentOptions::default()
            .with_model("opus")
            .with_max_turns(5)
            .with_timeout(Duration::from_secs(90));

        let merged = merged_run_options(&cfg, &agent, &opts);
        assert_eq!(merged.model.as_deref(), Some("opus"));
        assert_eq!(merged.max_turns, Some(5));
        assert_eq!(merged.timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn role_captured_tools_beat_config_tools() {
        let cfg = Config::default();
        let agent = agent_with_tools();

        let merged = merged_run_options(&cfg, &agent, &RunAgentOptions::default());
        assert_eq!(
            merged.allowed_tools,
            Some(vec!["Read".to_string(), "Grep".to_string()])
        );
    }

    #[test]
    fn spawn_options_builder() {
        let opts = SpawnOptions::default()
            .with_branch("feature/custom")
            .with_role("builder")
            .with_env("API_URL", "http://svc:8080");
        assert_eq!(opts.branch.as_deref(), Some("feature/custom"));
        assert_eq!(opts.role.as_deref(), Some("builder"));
        assert_eq!(opts.env.get("API_URL").map(String::as_str), Some("http://svc:8080"));
    }
}
