use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Agent;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Whole-fleet snapshot: every agent record keyed by name.
///
/// A `BTreeMap` keeps the on-disk document and every listing stable by
/// agent name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub agents: BTreeMap<String, Agent>,
}

impl FleetState {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Persistence seam for the fleet.
///
/// The store is the single source of truth for agent records; callers
/// re-read through it on every operation instead of caching records. Whole
/// snapshots and per-agent access are both first-class so reconciliation can
/// sweep the fleet while lifecycle operations touch one record at a time.
pub trait StateStore: Send + Sync {
    /// Load the full fleet snapshot. A store with no saved state yet loads
    /// as an empty snapshot, not an error.
    fn load(&self) -> Result<FleetState>;

    /// Replace the full fleet snapshot.
    fn save(&self, state: &FleetState) -> Result<()>;

    /// Fetch a single agent record by name.
    fn get_agent(&self, name: &str) -> Result<Option<Agent>>;

    /// Insert or replace a single agent record.
    fn put_agent(&self, agent: &Agent) -> Result<()>;

    /// Remove a single agent record. Returns `true` when a record existed.
    fn remove_agent(&self, name: &str) -> Result<bool>;

    /// All agent records, ordered by name.
    fn list_agents(&self) -> Result<Vec<Agent>>;
}

// ---------------------------------------------------------------------------
// JsonStateStore
// ---------------------------------------------------------------------------

/// File-system-backed fleet persistence.
///
/// The whole fleet lives in one JSON document at a configurable path
/// (defaults to `~/.tanuki/state.json`). Mutations are read-modify-write on
/// that document.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    /// Create a store with the default path (`~/.tanuki/state.json`).
    pub fn default_path() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tanuki")
            .join("state.json");
        Self { path }
    }

    /// Create a store backed by a custom file (useful for testing).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<FleetState> {
        if !self.path.exists() {
            return Ok(FleetState::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let state: FleetState = serde_json::from_str(&data)?;
        Ok(state)
    }

    fn save(&self, state: &FleetState) -> Result<()> {
        self.ensure_parent()?;
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        Ok(self.load()?.agents.get(name).cloned())
    }

    fn put_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.load()?;
        state.agents.insert(agent.name.clone(), agent.clone());
        self.save(&state)
    }

    fn remove_agent(&self, name: &str) -> Result<bool> {
        let mut state = self.load()?;
        let existed = state.agents.remove(name).is_some();
        if existed {
            self.save(&state)?;
        }
        Ok(existed)
    }

    fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.load()?.agents.into_values().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory fleet persistence for tests and embedded use.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: std::sync::Mutex<FleetState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<FleetState> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, state: &FleetState) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = state.clone();
        Ok(())
    }

    fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .agents
            .get(name)
            .cloned())
    }

    fn put_agent(&self, agent: &Agent) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .agents
            .insert(agent.name.clone(), agent.clone());
        Ok(())
    }

    fn remove_agent(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .agents
            .remove(name)
            .is_some())
    }

    fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .agents
            .values()
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
