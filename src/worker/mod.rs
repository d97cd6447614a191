//! Task execution: claiming, running, and recovering tasks.
//!
//! Core components:
//! - `governor` tracks tasks this process is executing and enforces capacity
//! - `orchestrator` is the claim loop that dispatches claimed tasks
//! - `runner` executes one claimed task to a terminal status
//! - `recovery` fails tasks whose executor disappeared

pub mod governor;
pub mod orchestrator;
pub mod recovery;
mod runner;

pub use governor::{ActiveTaskGuard, ActiveTaskRecord, ConcurrencyGovernor, Reservation};
pub use orchestrator::{Orchestrator, OrchestratorDeps, TickOutcome, spawn_claim_loop};
pub use recovery::{RecoverySweep, SweepReport, spawn_recovery_loop};
