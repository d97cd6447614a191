//! Execution machines and the engines they can run.

pub mod engine;
pub mod model;

pub use engine::{DEFAULT_WRAPPER, EngineWrapper, resolve_engine, wrapper_for};
pub use model::{LIVENESS_THRESHOLD, Machine, MachineStatus};
