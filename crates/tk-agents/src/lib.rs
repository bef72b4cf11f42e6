pub mod backend;
pub mod runner;
pub mod ralph;
pub mod roles;
pub mod services;
pub mod manager;
pub mod workstream;
pub mod orchestrator;
