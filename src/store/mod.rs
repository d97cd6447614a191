//! Persistence layer: task queue and machine registry.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{MachineRegistry, TaskStore};
