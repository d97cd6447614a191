//! Itachi orchestrator: claims queued coding tasks from a shared store and
//! runs them on execution machines.

pub mod channels;
pub mod config;
pub mod error;
pub mod exec;
pub mod machines;
pub mod store;
pub mod tasks;
pub mod worker;
pub mod workspace;
