use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tk_core::cancel::CancelToken;
use tk_core::config::Config;
use tk_core::types::workstream_agent_name;

use crate::backend::OutputSink;
use crate::manager::{AgentManager, ManagerError, RunAgentOptions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkstreamError {
    /// A task's dependencies never resolved within the wait budget.
    #[error("task {task_id} dependencies unresolved after {waited:?}")]
    DependencyTimeout { task_id: String, waited: Duration },
    #[error("workstream cancelled")]
    Cancelled,
    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),
    #[error("task store error: {0}")]
    Tasks(String),
}

pub type Result<T> = std::result::Result<T, WorkstreamError>;

// ---------------------------------------------------------------------------
// Task model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Assigned,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Whether a workstream may pick this task up. Assigned tasks already
    /// belong to a lane and are not re-selected.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Blocked)
    }
}

/// One unit of work fed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub content: String,
    pub status: TaskStatus,
    /// Ids of tasks that must be complete before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub workstream: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub verify_command: Option<String>,
    #[serde(default)]
    pub completion_signal: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            assignee: None,
            workstream: None,
            role: None,
            verify_command: None,
            completion_signal: None,
        }
    }

    pub fn with_workstream(mut self, workstream: impl Into<String>) -> Self {
        self.workstream = Some(workstream.into());
        self
    }

    pub fn with_depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    pub fn with_verify_command(mut self, cmd: impl Into<String>) -> Self {
        self.verify_command = Some(cmd.into());
        self
    }

    pub fn with_completion_signal(mut self, signal: impl Into<String>) -> Self {
        self.completion_signal = Some(signal.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Source of tasks for workstreams.
///
/// Backed by whatever tracks the project's work; implementations re-read
/// their source on `reload` so edits made while a stream runs are picked up
/// on the next cycle.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Re-read the backing source.
    async fn reload(&self) -> std::result::Result<(), String>;

    /// First runnable task for this workstream, in store order. The memory
    /// store ignores `project`; file-backed stores scope by it.
    async fn next_task(
        &self,
        project: &str,
        role: Option<&str>,
        workstream: &str,
    ) -> std::result::Result<Option<Task>, String>;

    /// Ids of this task's dependencies that are not complete yet.
    async fn blocking_deps(&self, task_id: &str) -> std::result::Result<Vec<String>, String>;

    async fn assign(&self, task_id: &str, agent: &str) -> std::result::Result<(), String>;

    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> std::result::Result<(), String>;
}

/// In-memory task store for tests and embedded use.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: std::sync::Mutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: std::sync::Mutex::new(tasks),
        }
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryTaskStore {
    async fn reload(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn next_task(
        &self,
        _project: &str,
        role: Option<&str>,
        workstream: &str,
    ) -> std::result::Result<Option<Task>, String> {
        let tasks = self.lock();
        Ok(tasks
            .iter()
            .find(|t| {
                t.status.is_runnable()
                    && t.workstream.as_deref().map_or(true, |w| w == workstream)
                    && match (role, t.role.as_deref()) {
                        (Some(want), Some(have)) => want == have,
                        _ => true,
                    }
            })
            .cloned())
    }

    async fn blocking_deps(&self, task_id: &str) -> std::result::Result<Vec<String>, String> {
        let tasks = self.lock();
        let task = tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| format!("unknown task: {task_id}"))?;
        Ok(task
            .depends_on
            .iter()
            .filter(|dep| {
                tasks
                    .iter()
                    .find(|t| &t.id == *dep)
                    .map_or(true, |t| t.status != TaskStatus::Complete)
            })
            .cloned()
            .collect())
    }

    async fn assign(&self, task_id: &str, agent: &str) -> std::result::Result<(), String> {
        let mut tasks = self.lock();
        match tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.assignee = Some(agent.to_string());
                Ok(())
            }
            None => Err(format!("unknown task: {task_id}")),
        }
    }

    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> std::result::Result<(), String> {
        let mut tasks = self.lock();
        match tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.status = status;
                Ok(())
            }
            None => Err(format!("unknown task: {task_id}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Callbacks fired as a workstream progresses. All default to no-ops.
pub trait WorkstreamHooks: Send + Sync {
    fn on_blocked(&self, _task: &Task, _deps: &[String]) {}
    fn on_task_complete(&self, _task: &Task) {}
    fn on_task_failed(&self, _task: &Task, _error: &str) {}
}

pub struct NoHooks;

impl WorkstreamHooks for NoHooks {}

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkstreamOptions {
    pub poll_interval: Duration,
    /// Upper bound on one task's dependency wait.
    pub max_wait: Duration,
    pub follow: bool,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

impl Default for WorkstreamOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WorkstreamOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.workstream.poll_interval(),
            max_wait: cfg.workstream.max_wait(),
            follow: cfg.workstream.follow,
            model: None,
            max_turns: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
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
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkstreamReport {
    pub completed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// WorkstreamRunner
// ---------------------------------------------------------------------------

/// Drives one named task lane against one agent.
///
/// The runner pulls tasks from the store in order, waits for their
/// dependencies, and executes each through the manager. One task failing is
/// recorded and the lane moves on; only infrastructure trouble (store
/// failures, dependency timeout, cancellation) ends the lane early.
pub struct WorkstreamRunner {
    project: String,
    workstream: String,
    role: Option<String>,
    agent_name: String,
    manager: Arc<AgentManager>,
    tasks: Arc<dyn TaskStore>,
    hooks: Arc<dyn WorkstreamHooks>,
    sink: Option<Arc<dyn OutputSink>>,
    opts: WorkstreamOptions,
}

impl WorkstreamRunner {
    pub fn new(
        project: impl Into<String>,
        workstream: impl Into<String>,
        manager: Arc<AgentManager>,
        tasks: Arc<dyn TaskStore>,
    ) -> Self {
        let project = project.into();
        let workstream = workstream.into();
        let agent_name = workstream_agent_name(&project, &workstream);
        Self {
            project,
            workstream,
            role: None,
            agent_name,
            manager,
            tasks,
            hooks: Arc::new(NoHooks),
            sink: None,
            opts: WorkstreamOptions::default(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorkstreamHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sink for live output when `follow` is on.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_options(mut self, opts: WorkstreamOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Deterministic agent name this lane is bound to.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Run the lane until the store has no more runnable tasks.
    pub async fn run(&self, cancel: &CancelToken) -> Result<WorkstreamReport> {
        let mut report = WorkstreamReport::default();
        info!(
            workstream = %self.workstream,
            agent = %self.agent_name,
            "workstream starting"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(WorkstreamError::Cancelled);
            }

            self.tasks.reload().await.map_err(WorkstreamError::Tasks)?;
            let task = self
                .tasks
                .next_task(&self.project, self.role.as_deref(), &self.workstream)
                .await
                .map_err(WorkstreamError::Tasks)?;

            let task = match task {
                Some(t) => t,
                None => break,
            };

            self.wait_for_deps(&task, cancel).await?;

            if self.execute(&task, cancel).await? {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            workstream = %self.workstream,
            completed = report.completed,
            failed = report.failed,
            "workstream complete"
        );
        Ok(report)
    }

    /// Poll until the task's dependencies are complete.
    async fn wait_for_deps(&self, task: &Task, cancel: &CancelToken) -> Result<()> {
        let start = tokio::time::Instant::now();

        loop {
            let deps = self
                .tasks
                .blocking_deps(&task.id)
                .await
                .map_err(WorkstreamError::Tasks)?;
            if deps.is_empty() {
                return Ok(());
            }

            self.hooks.on_blocked(task, &deps);
            debug!(task = %task.id, deps = ?deps, "task blocked on dependencies");

            if start.elapsed() >= self.opts.max_wait {
                warn!(task = %task.id, waited = ?start.elapsed(), "dependency wait timed out");
                return Err(WorkstreamError::DependencyTimeout {
                    task_id: task.id.clone(),
                    waited: start.elapsed(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.opts.poll_interval) => {}
                _ = cancel.cancelled() => return Err(WorkstreamError::Cancelled),
            }

            self.tasks.reload().await.map_err(WorkstreamError::Tasks)?;
        }
    }

    /// Execute one task. `Ok(true)` means completed, `Ok(false)` failed.
    async fn execute(&self, task: &Task, cancel: &CancelToken) -> Result<bool> {
        self.tasks
            .assign(&task.id, &self.agent_name)
            .await
            .map_err(WorkstreamError::Tasks)?;
        self.tasks
            .set_status(&task.id, TaskStatus::InProgress)
            .await
            .map_err(WorkstreamError::Tasks)?;

        let prompt = compose_prompt(task);
        info!(workstream = %self.workstream, task = %task.id, title = %task.title, "executing task");

        let mut run_opts = RunAgentOptions::default();
        run_opts.model = self.opts.model.clone();
        run_opts.max_turns = self.opts.max_turns;
        if self.opts.follow {
            if let Some(sink) = &self.sink {
                run_opts = run_opts.with_follow(sink.as_ref());
            }
        }

        let run_result = tokio::select! {
            res = self.manager.run(&self.agent_name, &prompt, run_opts) => res,
            _ = cancel.cancelled() => return Err(WorkstreamError::Cancelled),
        };

        match run_result {
            Ok(result) if result.success() => {
                self.tasks
                    .set_status(&task.id, TaskStatus::Complete)
                    .await
                    .map_err(WorkstreamError::Tasks)?;
                self.hooks.on_task_complete(task);
                info!(task = %task.id, "task complete");
                Ok(true)
            }
            Ok(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                self.fail_task(task, &message).await?;
                Ok(false)
            }
            Err(e) => {
                self.fail_task(task, &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn fail_task(&self, task: &Task, message: &str) -> Result<()> {
        warn!(task = %task.id, error = %message, "task failed");
        self.tasks
            .set_status(&task.id, TaskStatus::Failed)
            .await
            .map_err(WorkstreamError::Tasks)?;
        self.hooks.on_task_failed(task, message);
        Ok(())
    }
}

/// Build the prompt sent to the agent for one task.
fn compose_prompt(task: &Task) -> String {
    let mut prompt = format!("Task: {}\n\n{}", task.title, task.content);
    if let Some(cmd) = &task.verify_command {
        prompt.push_str(&format!(
            "\n\nVerify your work with `{cmd}` before finishing."
        ));
    }
    if let Some(signal) = &task.completion_signal {
        prompt.push_str(&format!(
            "\n\nWhen the task is fully complete, print {signal} on its own line."
        ));
    }
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(tasks: Vec<Task>) -> MemoryTaskStore {
        MemoryTaskStore::new(tasks)
    }

    #[tokio::test]
    async fn next_task_respects_store_order_and_status() {
        let store = store_with(vec![
            {
                let mut t = Task::new("t1", "first", "done already").with_workstream("auth");
                t.status = TaskStatus::Complete;
                t
            },
            Task::new("t2", "second", "do me").with_workstream("auth"),
            Task::new("t3", "third", "later").with_workstream("auth"),
        ]);

        let next = store.next_task("demo", None, "auth").await.unwrap().unwrap();
        assert_eq!(next.id, "t2");
    }

    #[tokio::test]
    async fn next_task_filters_other_workstreams() {
        let store = store_with(vec![
            Task::new("t1", "other lane", "x").with_workstream("payments"),
            Task::new("t2", "mine", "y").with_workstream("auth"),
        ]);

        let next = store.next_task("demo", None, "auth").await.unwrap().unwrap();
        assert_eq!(next.id, "t2");
    }

    #[tokio::test]
    async fn blocking_deps_reports_incomplete_only() {
        let store = store_with(vec![
            {
                let mut t = Task::new("t1", "done", "x").with_workstream("auth");
                t.status = TaskStatus::Complete;
                t
            },
            Task::new("t2", "pending dep", "y").with_workstream("auth"),
            Task::new("t3", "blocked", "z")
                .with_workstream("auth")
                .with_depends_on(vec!["t1".to_string(), "t2".to_string()]),
        ]);

        let deps = store.blocking_deps("t3").await.unwrap();
        assert_eq!(deps, vec!["t2".to_string()]);

        store.set_status("t2", TaskStatus::Complete).await.unwrap();
        assert!(store.blocking_deps("t3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assign_and_status_updates_are_visible() {
        let store = store_with(vec![Task::new("t1", "task", "x").with_workstream("auth")]);

        store.assign("t1", "demo-auth").await.unwrap();
        store.set_status("t1", TaskStatus::InProgress).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].assignee.as_deref(), Some("demo-auth"));
        assert_eq!(snapshot[0].status, TaskStatus::InProgress);

        assert!(store.assign("missing", "x").await.is_err());
    }

    #[test]
    fn prompt_includes_verify_and_signal_instructions() {
        let task = Task::new("t1", "Add login", "Implement the login endpoint.")
            .with_verify_command("cargo test")
            .with_completion_signal("DONE");

        let prompt = compose_prompt(&task);
        assert!(prompt.starts_with("Task: Add login"));
        assert!(prompt.contains("Implement the login endpoint."));
        assert!(prompt.contains("`cargo test`"));
        assert!(prompt.contains("print DONE on its own line"));

        let bare = compose_prompt(&Task::new("t2", "Plain", "No extras."));
        assert!(!bare.contains("Verify"));
        assert!(!bare.contains("print"));
    }

    #[test]
    fn options_come_from_config() {
        let mut cfg = Config::default();
        cfg.workstream.poll_interval_secs = 3;
        cfg.workstream.max_wait_secs = 60;
        cfg.workstream.follow = false;

        let opts = WorkstreamOptions::from_config(&cfg);
        assert_eq!(opts.poll_interval, Duration::from_secs(3));
        assert_eq!(opts.max_wait, Duration::from_secs(60));
        assert!(!opts.follow);
    }

    #[test]
    fn status_serializes_snake_case() {
        let wire = [
            (TaskStatus::Pending, "\"pending\""),
            (TaskStatus::Blocked, "\"blocked\""),
            (TaskStatus::Assigned, "\"assigned\""),
            (TaskStatus::InProgress, "\"in_progress\""),
            (TaskStatus::Complete, "\"complete\""),
            (TaskStatus::Failed, "\"failed\""),
        ];
        for (status, expected) in wire {
            assert_eq!(serde_json::to_string(&status).unwrap(), expected);
            let parsed: TaskStatus = serde_json::from_str(expected).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn assigned_tasks_are_not_reselected() {
        assert!(!TaskStatus::Assigned.is_runnable());
        assert!(TaskStatus::Pending.is_runnable());
        assert!(TaskStatus::Blocked.is_runnable());
    }
}
