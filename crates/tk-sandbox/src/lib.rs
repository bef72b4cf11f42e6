//! Container substrate for tanuki agents.
//!
//! Each agent owns one long-lived container with its worktree mounted at a
//! fixed workdir. The container idles on a keep-alive process; every command
//! the engine issues is an exec inside it, so stopping and starting an agent
//! preserves its environment between runs.
//!
//! Key components:
//! - [`container::ContainerControl`] — the capability seam the engine consumes
//! - [`docker::DockerCli`] — production implementation over the docker binary
//! - [`container::ExecStream`] — live output streaming for follow-mode runs

pub mod container;
pub mod docker;
