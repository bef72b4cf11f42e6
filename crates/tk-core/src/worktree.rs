use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::BRANCH_PREFIX;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A worktree directory already exists for this agent.
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
    /// No worktree found for this agent.
    #[error("worktree not found: {0}")]
    NotFound(String),
    /// A git command failed. `stderr` carries git's own explanation.
    #[error("git {context} failed: {stderr}")]
    Git { context: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

/// Description of one agent worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory and return (success, stdout, stderr).
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Git runner that shells out to the `git` binary.
pub struct SystemGitRunner;

impl GitRunner for SystemGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeControl
// ---------------------------------------------------------------------------

/// Capability seam for agent worktrees.
///
/// One worktree per agent, on a branch in the `tanuki/` namespace, placed
/// under the repository's worktree directory. The lifecycle manager talks to
/// this trait only; production code wires in [`GitWorktrees`].
pub trait WorktreeControl: Send + Sync {
    /// Create a worktree and branch for an agent. The branch defaults to
    /// `tanuki/{name}` unless overridden.
    fn create(&self, name: &str, branch: Option<&str>) -> Result<WorktreeInfo>;

    /// Remove an agent's worktree. The branch is deleted too unless
    /// `keep_branch` is set. Removing a worktree that is already gone is a
    /// no-op.
    fn remove(&self, name: &str, keep_branch: bool) -> Result<()>;

    /// Whether a worktree directory exists for this agent.
    fn exists(&self, name: &str) -> bool;

    /// Filesystem path where the agent's worktree lives (or would live).
    fn path_for(&self, name: &str) -> PathBuf;

    /// Branch name for an agent worktree: `tanuki/{name}`.
    fn branch_for(&self, name: &str) -> String {
        format!("{BRANCH_PREFIX}{name}")
    }

    /// Resolve the base branch new worktrees fork from.
    fn base_branch(&self) -> Result<String>;

    /// Diff stat of the worktree against the base branch.
    fn diff(&self, name: &str) -> Result<String>;

    /// Porcelain status of the worktree.
    fn status(&self, name: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// GitWorktrees
// ---------------------------------------------------------------------------

/// Production worktree control over the git CLI.
///
/// Worktrees are placed at `{repo_root}/{worktree_dir}/{name}` with a branch
/// named `tanuki/{name}` forked from the resolved base branch.
pub struct GitWorktrees {
    repo_root: PathBuf,
    worktree_dir: PathBuf,
    git: Box<dyn GitRunner>,
}

impl GitWorktrees {
    /// Create a control rooted at `repo_root` with the system git runner.
    pub fn new(repo_root: impl Into<PathBuf>, worktree_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_dir: worktree_dir.into(),
            git: Box::new(SystemGitRunner),
        }
    }

    /// Create a control with a custom git runner (for testing).
    pub fn with_git_runner(
        repo_root: impl Into<PathBuf>,
        worktree_dir: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_dir: worktree_dir.into(),
            git,
        }
    }

    fn root_str(&self) -> String {
        self.repo_root.display().to_string()
    }

    fn run(&self, dir: &str, context: &str, args: &[&str]) -> Result<GitOutput> {
        match self.git.run_git(dir, args) {
            Ok(out) if out.success => Ok(out),
            Ok(out) => Err(WorktreeError::Git {
                context: context.to_string(),
                stderr: out.stderr,
            }),
            Err(e) => Err(WorktreeError::Git {
                context: context.to_string(),
                stderr: e,
            }),
        }
    }

    /// Branch currently checked out in a worktree, falling back to the
    /// conventional branch name when git cannot answer.
    fn worktree_branch(&self, name: &str) -> String {
        let path = self.path_for(name).display().to_string();
        match self.git.run_git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]) {
            Ok(out) if out.success && !out.stdout.trim().is_empty() => {
                out.stdout.trim().to_string()
            }
            _ => self.branch_for(name),
        }
    }
}

impl WorktreeControl for GitWorktrees {
    fn create(&self, name: &str, branch: Option<&str>) -> Result<WorktreeInfo> {
        let path = self.path_for(name);
        let branch = branch
            .map(String::from)
            .unwrap_or_else(|| self.branch_for(name));

        if path.exists() {
            return Err(WorktreeError::AlreadyExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let base = self.base_branch()?;
        let path_str = path.display().to_string();

        info!(
            agent = %name,
            worktree = %path_str,
            branch = %branch,
            base = %base,
            "creating worktree"
        );

        self.run(
            &self.root_str(),
            "worktree add",
            &["worktree", "add", "-b", &branch, &path_str, &base],
        )?;

        Ok(WorktreeInfo {
            name: name.to_string(),
            path,
            branch,
            base_branch: base,
            created_at: Utc::now(),
        })
    }

    fn remove(&self, name: &str, keep_branch: bool) -> Result<()> {
        let path = self.path_for(name);
        if !path.exists() {
            debug!(agent = %name, "worktree already gone, nothing to remove");
            return Ok(());
        }

        let branch = self.worktree_branch(name);
        let path_str = path.display().to_string();

        info!(agent = %name, worktree = %path_str, "removing worktree");

        self.run(
            &self.root_str(),
            "worktree remove",
            &["worktree", "remove", "--force", &path_str],
        )?;

        if !keep_branch {
            // Best-effort: the branch may be checked out elsewhere or merged.
            match self
                .git
                .run_git(&self.root_str(), &["branch", "-D", &branch])
            {
                Ok(out) if out.success => {}
                Ok(out) => {
                    warn!(branch = %branch, stderr = %out.stderr, "failed to delete branch")
                }
                Err(e) => warn!(branch = %branch, error = %e, "failed to delete branch"),
            }
        }

        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.repo_root.join(&self.worktree_dir).join(name)
    }

    fn base_branch(&self) -> Result<String> {
        // Prefer the remote HEAD when the repo has one.
        if let Ok(out) = self.git.run_git(
            &self.root_str(),
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        ) {
            if out.success {
                if let Some(branch) = out.stdout.trim().strip_prefix("origin/") {
                    if !branch.is_empty() {
                        return Ok(branch.to_string());
                    }
                }
            }
        }

        for candidate in ["main", "master"] {
            if let Ok(out) = self
                .git
                .run_git(&self.root_str(), &["rev-parse", "--verify", candidate])
            {
                if out.success {
                    return Ok(candidate.to_string());
                }
            }
        }

        Ok("main".to_string())
    }

    fn diff(&self, name: &str) -> Result<String> {
        if !self.exists(name) {
            return Err(WorktreeError::NotFound(name.to_string()));
        }
        let base = self.base_branch()?;
        let dir = self.path_for(name).display().to_string();
        let out = self.run(&dir, "diff", &["diff", "--stat", &base])?;
        Ok(out.stdout)
    }

    fn status(&self, name: &str) -> Result<String> {
        if !self.exists(name) {
            return Err(WorktreeError::NotFound(name.to_string()));
        }
        let dir = self.path_for(name).display().to_string();
        let out = self.run(&dir, "status", &["status", "--porcelain"])?;
        Ok(out.stdout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A mock git runner that records commands and returns canned responses.
    struct MockGitRunner {
        /// Canned responses: for each call in order, return this.
        responses: Mutex<Vec<GitOutput>>,
        /// Record of all commands that were run.
        commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockGitRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<(String, Vec<String>)> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands.lock().unwrap().push((
                dir.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));

            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput::ok(""))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    impl GitRunner for std::sync::Arc<MockGitRunner> {
        fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.as_ref().run_git(dir, args)
        }
    }

    fn temp_control(git: Box<dyn GitRunner>) -> (GitWorktrees, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let control = GitWorktrees::with_git_runner(
            dir.path(),
            PathBuf::from(".tanuki/worktrees"),
            git,
        );
        (control, dir)
    }

    #[test]
    fn create_builds_path_and_branch() {
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("origin/main\n"), // symbolic-ref
            GitOutput::ok(""),              // worktree add
        ]);
        let (control, dir) = temp_control(Box::new(mock));

        let info = control.create("web-api", None).unwrap();
        assert_eq!(info.branch, "tanuki/web-api");
        assert_eq!(info.base_branch, "main");
        assert_eq!(
            info.path,
            dir.path().join(".tanuki/worktrees").join("web-api")
        );
    }

    #[test]
    fn create_honors_branch_override() {
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("origin/main\n"),
            GitOutput::ok(""),
        ]);
        let (control, _dir) = temp_control(Box::new(mock));

        let info = control.create("web-api", Some("tanuki/custom")).unwrap();
        assert_eq!(info.branch, "tanuki/custom");
    }

    #[test]
    fn create_rejects_existing_directory() {
        let (control, dir) = temp_control(Box::new(MockGitRunner::new(vec![])));
        let wt = dir.path().join(".tanuki/worktrees").join("web-api");
        std::fs::create_dir_all(&wt).unwrap();

        let err = control.create("web-api", None).unwrap_err();
        assert!(matches!(err, WorktreeError::AlreadyExists(_)));
    }

    #[test]
    fn create_surfaces_git_failure() {
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("origin/main\n"),
            GitOutput::failed("fatal: branch exists"),
        ]);
        let (control, _dir) = temp_control(Box::new(mock));

        let err = control.create("web-api", None).unwrap_err();
        match err {
            WorktreeError::Git { context, stderr } => {
                assert_eq!(context, "worktree add");
                assert!(stderr.contains("branch exists"));
            }
            other => panic!("expected Git error, got {other:?}"),
        }
    }

    #[test]
    fn remove_missing_worktree_is_noop() {
        let mock = MockGitRunner::new(vec![]);
        let (control, _dir) = temp_control(Box::new(mock));
        assert!(control.remove("ghost", false).is_ok());
    }

    #[test]
    fn remove_deletes_branch_unless_kept() {
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("tanuki/web-api\n"), // rev-parse HEAD in worktree
            GitOutput::ok(""),                 // worktree remove
            GitOutput::ok(""),                 // branch -D
        ]);
        let (control, dir) = temp_control(Box::new(mock));
        let wt = dir.path().join(".tanuki/worktrees").join("web-api");
        std::fs::create_dir_all(&wt).unwrap();

        control.remove("web-api", false).unwrap();

        // Rebuild a control that shares no state to check the keep_branch path.
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("tanuki/web-api\n"),
            GitOutput::ok(""),
        ]);
        let (control, dir) = temp_control(Box::new(mock));
        let wt = dir.path().join(".tanuki/worktrees").join("web-api");
        std::fs::create_dir_all(&wt).unwrap();

        control.remove("web-api", true).unwrap();
    }

    #[test]
    fn base_branch_falls_back_to_master() {
        let mock = MockGitRunner::new(vec![
            GitOutput::failed("no remote HEAD"), // symbolic-ref
            GitOutput::failed("unknown ref"),    // rev-parse main
            GitOutput::ok("abc123\n"),           // rev-parse master
        ]);
        let (control, _dir) = temp_control(Box::new(mock));
        assert_eq!(control.base_branch().unwrap(), "master");
    }

    #[test]
    fn diff_requires_existing_worktree() {
        let (control, _dir) = temp_control(Box::new(MockGitRunner::new(vec![])));
        let err = control.diff("ghost").unwrap_err();
        assert!(matches!(err, WorktreeError::NotFound(_)));
    }

    #[test]
    fn diff_runs_against_base_in_worktree() {
        let mock = MockGitRunner::new(vec![
            GitOutput::ok("origin/main\n"),        // symbolic-ref
            GitOutput::ok("src/lib.rs | 4 ++--\n"), // diff
        ]);
        let (control, dir) = temp_control(Box::new(mock));
        let wt = dir.path().join(".tanuki/worktrees").join("web-api");
        std::fs::create_dir_all(&wt).unwrap();

        let diff = control.diff("web-api").unwrap();
        assert!(diff.contains("src/lib.rs"));
    }

    #[test]
    fn commands_run_in_expected_directories() {
        let mock = std::sync::Arc::new(MockGitRunner::new(vec![
            GitOutput::ok("origin/main\n"),
            GitOutput::ok(""),
        ]));
        let (control, dir) = temp_control(Box::new(std::sync::Arc::clone(&mock)));
        control.create("web-api", None).unwrap();

        let commands = mock.commands();
        let add = commands
            .iter()
            .find(|(_, args)| args.first().map(String::as_str) == Some("worktree"))
            .expect("worktree add recorded");
        assert_eq!(add.0, dir.path().display().to_string());
        assert!(add.1.contains(&"tanuki/web-api".to_string()));
    }
}
