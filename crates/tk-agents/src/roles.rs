use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// A named way of working: prompt, context, and tool policy for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub system_prompt: String,
    /// Glob patterns, relative to the repository root, of files staged into
    /// the worktree at spawn.
    #[serde(default)]
    pub context_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Role {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            context_patterns: Vec::new(),
            allowed_tools: None,
            disallowed_tools: None,
            max_turns: None,
            model: None,
        }
    }

    pub fn with_context_patterns(mut self, patterns: Vec<String>) -> Self {
        self.context_patterns = patterns;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    pub fn with_disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.disallowed_tools = Some(tools);
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RoleResolver
// ---------------------------------------------------------------------------

/// Maps a role name to its definition. `None` means the name is not
/// recognized and spawn must refuse it.
pub trait RoleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Role>;
}

/// Resolver over a fixed in-memory set of roles.
#[derive(Default)]
pub struct StaticRoles {
    roles: HashMap<String, Role>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role.name.clone(), role);
        self
    }
}

impl RoleResolver for StaticRoles {
    fn resolve(&self, name: &str) -> Option<Role> {
        self.roles.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Context staging
// ---------------------------------------------------------------------------

/// Copy role context files from the repository into a worktree.
///
/// Patterns resolve relative to `repo_root`; matches are copied to the same
/// relative path under `worktree`. Unmatched patterns and per-file copy
/// failures are skipped, never fatal. Returns the relative paths staged.
pub fn stage_context_files(repo_root: &Path, worktree: &Path, patterns: &[String]) -> Vec<String> {
    let mut staged = Vec::new();

    for pattern in patterns {
        let full = repo_root.join(pattern);
        let full = match full.to_str() {
            Some(s) => s.to_string(),
            None => {
                debug!(pattern = %pattern, "skipping non-utf8 context pattern");
                continue;
            }
        };

        let paths = match glob::glob(&full) {
            Ok(paths) => paths,
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "invalid context pattern");
                continue;
            }
        };

        let mut matched = false;
        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    debug!(pattern = %pattern, error = %e, "unreadable context match");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            matched = true;

            let rel = match path.strip_prefix(repo_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let target = worktree.join(&rel);

            if let Some(parent) = target.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %rel.display(), error = %e, "failed to stage context file");
                    continue;
                }
            }
            match std::fs::copy(&path, &target) {
                Ok(_) => staged.push(rel.to_string_lossy().to_string()),
                Err(e) => {
                    warn!(path = %rel.display(), error = %e, "failed to stage context file");
                }
            }
        }

        if !matched {
            debug!(pattern = %pattern, "context pattern matched nothing");
        }
    }

    staged
}

/// Render the instructions file placed in the worktree at spawn.
pub fn render_instructions(role: &Role, staged: &[String], service_docs: Option<&str>) -> String {
    let mut body = format!("# Role: {}\n\n{}\n", role.name, role.system_prompt.trim());

    if !staged.is_empty() {
        body.push_str("\n## Staged context\n\n");
        for path in staged {
            body.push_str(&format!("- {path}\n"));
        }
    }

    if let Some(docs) = service_docs {
        body.push_str("\n## Services\n\n");
        body.push_str(docs.trim());
        body.push('\n');
    }

    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_roles_resolve() {
        let roles = StaticRoles::new()
            .with_role(Role::new("reviewer", "Review changes carefully.").with_max_turns(10));

        let role = roles.resolve("reviewer").unwrap();
        assert_eq!(role.max_turns, Some(10));
        assert!(roles.resolve("unknown").is_none());
    }

    #[test]
    fn staging_copies_matches_and_skips_misses() {
        let repo = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();

        std::fs::write(repo.path().join("STYLE.md"), "style guide").unwrap();
        std::fs::create_dir_all(repo.path().join("docs")).unwrap();
        std::fs::write(repo.path().join("docs/api.md"), "api docs").unwrap();

        let patterns = vec![
            "*.md".to_string(),
            "docs/**/*.md".to_string(),
            "missing/**/*.txt".to_string(),
        ];
        let mut staged = stage_context_files(repo.path(), worktree.path(), &patterns);
        staged.sort();

        assert_eq!(staged, vec!["STYLE.md".to_string(), "docs/api.md".to_string()]);
        assert_eq!(
            std::fs::read_to_string(worktree.path().join("docs/api.md")).unwrap(),
            "api docs"
        );
    }

    #[test]
    fn instructions_carry_prompt_and_sections() {
        let role = Role::new("builder", "Implement the assigned task.");
        let staged = vec!["STYLE.md".to_string()];

        let body = render_instructions(&role, &staged, Some("db at postgres://svc:5432"));
        assert!(body.starts_with("# Role: builder"));
        assert!(body.contains("Implement the assigned task."));
        assert!(body.contains("- STYLE.md"));
        assert!(body.contains("## Services"));
        assert!(body.contains("postgres://svc:5432"));

        let bare = render_instructions(&role, &[], None);
        assert!(!bare.contains("## Staged context"));
        assert!(!bare.contains("## Services"));
    }
}
