pub mod cancel;
pub mod config;
pub mod state;
pub mod types;
pub mod worktree;
