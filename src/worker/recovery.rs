//! Stale recovery sweep.
//!
//! Runs on its own interval, independent of the claim loop:
//! 1. Held tasks (claimed/running) older than `stale_after` that this
//!    process is not executing are failed, provided their orchestrator is
//!    this one, unknown, or has stopped heartbeating.
//! 2. Unassigned queued tasks older than `starvation_after` are reported.
//!    They are never failed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::NotifySink;
use crate::config::RecoveryConfig;
use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::{Task, TaskStatus, TaskUpdate};

use super::governor::ConcurrencyGovernor;

/// Error message written to recovered tasks.
pub const RECOVERED_MESSAGE: &str =
    "Recovered: task was abandoned by its orchestrator and has been marked failed";

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Held tasks that were failed.
    pub recovered: Vec<Uuid>,
    /// Stale held tasks left alone because their owner is alive.
    pub skipped: Vec<Uuid>,
    /// Queued tasks waiting too long for a machine.
    pub starving: Vec<Uuid>,
}

pub struct RecoverySweep {
    store: Arc<dyn TaskStore>,
    governor: ConcurrencyGovernor,
    notify: NotifySink,
    orchestrator_id: String,
    config: RecoveryConfig,
    /// Starving tasks already alerted on.
    alerted: Mutex<HashSet<Uuid>>,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn TaskStore>,
        governor: ConcurrencyGovernor,
        notify: NotifySink,
        orchestrator_id: impl Into<String>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            governor,
            notify,
            orchestrator_id: orchestrator_id.into(),
            config,
            alerted: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run one sweep. Store errors are logged and end that phase early.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        self.recover_stale(now, &mut report).await;
        self.report_starvation(now, &mut report).await;

        if !report.recovered.is_empty() || !report.starving.is_empty() {
            info!(
                recovered = report.recovered.len(),
                skipped = report.skipped.len(),
                starving = report.starving.len(),
                "Recovery sweep finished"
            );
        }
        report
    }

    async fn recover_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = ago(now, self.config.stale_after);
        let stale = match self
            .store
            .list_stale(&[TaskStatus::Claimed, TaskStatus::Running], cutoff)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list stale tasks");
                return;
            }
        };

        for task in stale {
            if self.governor.contains(task.id) {
                debug!(task_id = %task.id, "Stale task is still executing here, leaving it");
                continue;
            }

            let Some(reason) = self.abandonment(&task, now).await else {
                report.skipped.push(task.id);
                continue;
            };

            let mut update = TaskUpdate::failed(RECOVERED_MESSAGE);
            if let Some(owner) = &task.orchestrator_id {
                update = update.owned_by(owner.clone());
            }

            match self.store.update_task(task.id, &update).await {
                Ok(()) => {
                    warn!(
                        task_id = %task.id,
                        status = %task.status,
                        owner = task.orchestrator_id.as_deref().unwrap_or("none"),
                        held_since = %task.held_since(),
                        reason,
                        "Recovered abandoned task"
                    );
                    report.recovered.push(task.id);
                    self.notify.notify(
                        task.notify_thread_id.clone(),
                        format!(
                            "Task {} was marked failed: its executor stopped responding",
                            task.short_id()
                        ),
                    );
                }
                Err(DatabaseError::Constraint(detail)) => {
                    debug!(task_id = %task.id, %detail, "Task moved on before recovery");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover task"),
            }
        }
    }

    /// Why `task`'s holder is considered gone, or `None` if it may be alive.
    async fn abandonment(&self, task: &Task, now: DateTime<Utc>) -> Option<&'static str> {
        let owner = match task.orchestrator_id.as_deref() {
            None => return Some("no owner recorded"),
            Some(id) if id == self.orchestrator_id => return Some("owned by this orchestrator"),
            Some(id) => id,
        };

        match self.store.orchestrator_last_seen(owner).await {
            Ok(None) => Some("owner never sent a heartbeat"),
            Ok(Some(seen)) if seen < ago(now, self.config.heartbeat_ttl) => {
                Some("owner heartbeat expired")
            }
            Ok(Some(_)) => {
                debug!(task_id = %task.id, owner, "Owner is alive, not recovering");
                None
            }
            Err(e) => {
                warn!(task_id = %task.id, owner, error = %e, "Could not check owner heartbeat");
                None
            }
        }
    }

    async fn report_starvation(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = ago(now, self.config.starvation_after);
        let queued = match self.store.list_queued(cutoff).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list queued tasks");
                return;
            }
        };

        let mut fresh = Vec::new();
        {
            let mut alerted = self.alerted.lock().unwrap_or_else(PoisonError::into_inner);
            alerted.retain(|id| queued.iter().any(|t| t.id == *id));
            for task in &queued {
                if alerted.insert(task.id) {
                    fresh.push(task);
                }
            }
        }

        for task in &queued {
            let waiting_mins = now.signed_duration_since(task.created_at).num_minutes();
            warn!(
                task_id = %task.id,
                project = %task.project,
                waiting_mins,
                "Task waiting for a machine"
            );
            report.starving.push(task.id);
        }

        if fresh.is_empty() {
            return;
        }
        if let Some(thread) = &self.config.alert_thread_id {
            let mut text = format!("{} task(s) waiting for a machine:", fresh.len());
            for task in fresh {
                text.push_str(&format!("\n- {} {}", task.short_id(), task.project));
            }
            self.notify.notify(Some(thread.clone()), text);
        }
    }
}

fn ago(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Spawn the recovery loop. Stops when `shutdown` flips to `true` or its
/// sender is dropped.
pub fn spawn_recovery_loop(
    sweep: Arc<RecoverySweep>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = sweep.config().interval.as_secs(),
            "Recovery loop started"
        );

        let mut tick = tokio::time::interval(sweep.config().interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    sweep.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Recovery loop stopped");
    })
}
