//! Claim loop: heartbeat, reserve capacity, claim, dispatch.
//!
//! One loop per process. Each dispatched task runs on its own tokio task
//! (see `runner`), so a slow or failing execution never blocks claiming.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::channels::{Notifier, NotifySink};
use crate::config::OrchestratorConfig;
use crate::error::{RegistryError, TaskError};
use crate::exec::RemoteExecutor;
use crate::store::{MachineRegistry, TaskStore};
use crate::workspace::WorkspaceProvisioner;

use super::governor::ConcurrencyGovernor;
use super::runner;

/// External services the orchestrator talks to.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<dyn MachineRegistry>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub notifier: Arc<dyn Notifier>,
}

/// Result of one claim loop tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A task was claimed and handed to a runner.
    Dispatched(Uuid),
    /// Nothing claimable.
    Idle,
    /// The machine has no free slot.
    AtCapacity,
    /// The claim could not be issued.
    StoreError,
}

pub struct Orchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) deps: OrchestratorDeps,
    pub(super) governor: ConcurrencyGovernor,
    pub(super) provisioner: WorkspaceProvisioner,
    pub(super) notify: NotifySink,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> Self {
        let provisioner = WorkspaceProvisioner::new(
            Arc::clone(&deps.executor),
            config.repos_root.clone(),
            config.exec_timeout,
        );
        let notify = NotifySink::new(Arc::clone(&deps.notifier));
        Self {
            config,
            deps,
            governor: ConcurrencyGovernor::new(),
            provisioner,
            notify,
        }
    }

    /// Share a governor with other components (the recovery sweep).
    pub fn with_governor(mut self, governor: ConcurrencyGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Forget all in-process state. Running executions are not stopped.
    pub fn reset(&self) {
        self.governor.reset();
    }

    /// Ask a running task to stop. Kills its session if it has one.
    pub async fn cancel_task(&self, task_id: Uuid) -> crate::error::Result<()> {
        let session = self.governor.request_cancel(task_id)?;
        info!(task_id = %task_id, live_session = session.is_some(), "Cancellation requested");
        if let Some(session) = session {
            session.kill().await?;
        }
        Ok(())
    }

    /// Write `input` to a running task's session.
    pub async fn send_input(&self, task_id: Uuid, input: &str) -> crate::error::Result<()> {
        let session = self
            .governor
            .session(task_id)
            .ok_or(TaskError::NotActive { id: task_id })?;
        session.write(input).await?;
        debug!(task_id = %task_id, bytes = input.len(), "Input sent to session");
        Ok(())
    }

    /// Run one claim loop iteration.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        self.heartbeat().await;

        let machine_id = self.config.machine_id.as_str();
        let cap = self.capacity().await;

        let Some(reservation) = self.governor.try_reserve(machine_id, cap) else {
            debug!(machine_id, cap, "At capacity, skipping claim");
            return TickOutcome::AtCapacity;
        };

        let task = match self
            .deps
            .store
            .claim_next(&self.config.orchestrator_id, machine_id)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return TickOutcome::Idle,
            Err(e) => {
                warn!(machine_id, error = %e, "Failed to claim task");
                return TickOutcome::StoreError;
            }
        };

        let task_id = task.id;
        info!(
            task_id = %task_id,
            project = %task.project,
            priority = task.priority,
            machine_id,
            "Claimed task"
        );

        let guard = reservation.activate(task_id, task.notify_thread_id.clone());
        let span = info_span!("task", task_id = %task_id, project = %task.project);
        tokio::spawn(runner::run_task(Arc::clone(self), task, guard).instrument(span));

        TickOutcome::Dispatched(task_id)
    }

    async fn heartbeat(&self) {
        let machine_id = &self.config.machine_id;

        if let Err(e) = self.deps.registry.heartbeat(machine_id).await {
            warn!(machine_id = %machine_id, error = %e, "Machine heartbeat failed");
        }

        if let Err(e) = self
            .deps
            .store
            .record_orchestrator_heartbeat(&self.config.orchestrator_id)
            .await
        {
            warn!(error = %e, "Orchestrator heartbeat failed");
        }

        match self
            .deps
            .registry
            .mark_stale_offline(self.config.machine_liveness)
            .await
        {
            Ok(changed) => {
                for machine in changed {
                    info!(
                        machine_id = %machine.id,
                        last_heartbeat = %machine.last_heartbeat,
                        "Machine marked offline"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to mark stale machines offline"),
        }
    }

    /// The machine's concurrency cap, or the configured one if unresolvable.
    async fn capacity(&self) -> usize {
        match self
            .deps
            .registry
            .resolve_machine(&self.config.machine_id)
            .await
        {
            Ok(machine) => machine.max_concurrent,
            Err(RegistryError::NotFound(id)) => {
                debug!(machine_id = %id, "Machine not registered, using configured cap");
                self.config.max_concurrent
            }
            Err(e) => {
                warn!(error = %e, "Registry unavailable, using configured cap");
                self.config.max_concurrent
            }
        }
    }
}

/// Spawn the claim loop. Stops when `shutdown` flips to `true` or its
/// sender is dropped.
pub fn spawn_claim_loop(
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = orchestrator.config();
        info!(
            orchestrator_id = %config.orchestrator_id,
            machine_id = %config.machine_id,
            interval_secs = config.poll_interval.as_secs(),
            "Claim loop started"
        );

        let mut tick = tokio::time::interval(config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Keep claiming while there is work and capacity.
            while let TickOutcome::Dispatched(_) = orchestrator.tick().await {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        info!(
            active = orchestrator.governor().active_count(),
            "Claim loop stopped"
        );
    })
}
