//! Persistence contracts for tasks and machines.
//!
//! Both traits are object-safe and used as `Arc<dyn ...>` so the
//! orchestrator can run against libSQL in production and stubs in tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, RegistryError};
use crate::machines::Machine;
use crate::tasks::{Task, TaskStatus, TaskUpdate};

/// Shared task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically claim the best queued task for `machine_id`.
    ///
    /// Candidates are queued tasks with no machine or assigned to
    /// `machine_id`, highest priority first, then oldest. At most one
    /// caller wins a given task; losers see `None` or the next task.
    async fn claim_next(
        &self,
        orchestrator_id: &str,
        machine_id: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Apply a partial update.
    ///
    /// Returns [`DatabaseError::Constraint`] when the status transition is
    /// not allowed from the stored status, or the owner guard does not match.
    async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), DatabaseError>;

    /// Tasks in `statuses` held since before `older_than`.
    async fn list_stale(
        &self,
        statuses: &[TaskStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Queued tasks with no machine, created before `older_than`.
    async fn list_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Record that `orchestrator_id` is alive now.
    async fn record_orchestrator_heartbeat(&self, orchestrator_id: &str)
    -> Result<(), DatabaseError>;

    /// Last heartbeat of `orchestrator_id`, if it ever sent one.
    async fn orchestrator_last_seen(
        &self,
        orchestrator_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;
}

/// Registry of execution machines.
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Look up a machine by ID.
    async fn resolve_machine(&self, id: &str) -> Result<Machine, RegistryError>;

    /// A reachable machine that has a checkout of `project`.
    async fn get_machine_for_project(&self, project: &str)
    -> Result<Option<Machine>, RegistryError>;

    /// Mark online machines with heartbeats older than `threshold` offline.
    /// Returns the machines that changed.
    async fn mark_stale_offline(&self, threshold: Duration) -> Result<Vec<Machine>, RegistryError>;

    /// Refresh `machine_id`'s heartbeat and mark it online.
    async fn heartbeat(&self, machine_id: &str) -> Result<(), RegistryError>;
}
