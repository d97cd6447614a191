//! End-to-end orchestration against an in-memory store and a scripted
//! executor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tracing_test::traced_test;
use uuid::Uuid;

use itachi_orchestrator::channels::Notifier;
use itachi_orchestrator::config::OrchestratorConfig;
use itachi_orchestrator::error::{ChannelError, DatabaseError, ExecError, RegistryError};
use itachi_orchestrator::exec::{
    ExecOutput, RemoteExecutor, SessionControl, SessionEvent, SpawnedSession, TargetInfo,
};
use itachi_orchestrator::machines::Machine;
use itachi_orchestrator::store::{LibSqlBackend, MachineRegistry, TaskStore};
use itachi_orchestrator::tasks::{NewTask, Task, TaskStatus, TaskUpdate};
use itachi_orchestrator::worker::{Orchestrator, OrchestratorDeps, TickOutcome};

const MACHINE: &str = "mac";

// ── Stubs ───────────────────────────────────────────────────────────

#[derive(Default)]
struct StubControl {
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    inputs: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionControl for StubControl {
    async fn write(&self, input: &str) -> Result<(), ExecError> {
        self.inputs.lock().unwrap().push(input.to_string());
        Ok(())
    }

    async fn kill(&self) -> Result<(), ExecError> {
        let tx = self.events.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(SessionEvent::Exit(None)).await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct StubExecutor {
    commands: Mutex<Vec<String>>,
    /// Engine runs wait for a permit when set.
    gate: Option<Arc<Semaphore>>,
    /// Engine runs panic.
    panic_engine: bool,
    /// Every remote branch probe misses.
    no_branches: bool,
    /// Sessions stay open until killed.
    hang_sessions: bool,
    /// Every exec fails at the transport.
    unreachable: bool,
    last_session: Mutex<Option<Arc<StubControl>>>,
}

fn output(success: bool, code: i32, stdout: &str) -> ExecOutput {
    ExecOutput {
        success,
        stdout: stdout.to_string(),
        exit_code: Some(code),
        ..Default::default()
    }
}

#[async_trait]
impl RemoteExecutor for StubExecutor {
    async fn exec(
        &self,
        _target: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        self.commands.lock().unwrap().push(command.to_string());

        if self.unreachable {
            return Err(ExecError::Unreachable {
                target: MACHINE.to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        if command.contains("ls-remote") {
            return Ok(if self.no_branches {
                output(false, 2, "")
            } else {
                output(true, 0, "abc123\trefs/heads/main\n")
            });
        }
        if command.contains("git diff --name-only") {
            return Ok(output(true, 0, "src/lib.rs\nsrc/main.rs\nsrc/lib.rs\n"));
        }
        if command.contains("--max-budget-usd") {
            if self.panic_engine {
                panic!("engine wrapper crashed");
            }
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            return Ok(output(true, 0, "\x1b[32mAll done\x1b[0m\n"));
        }
        Ok(output(true, 0, ""))
    }

    async fn spawn_session(
        &self,
        _target: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<SpawnedSession, ExecError> {
        self.commands.lock().unwrap().push(command.to_string());

        let (tx, rx) = mpsc::channel(16);
        tx.try_send(SessionEvent::Stdout("working on it\n".into()))
            .unwrap();
        let control = Arc::new(StubControl::default());
        if self.hang_sessions {
            *control.events.lock().unwrap() = Some(tx);
        } else {
            tx.try_send(SessionEvent::Exit(Some(0))).unwrap();
        }
        *self.last_session.lock().unwrap() = Some(control.clone());

        Ok(SpawnedSession {
            control,
            events: rx,
        })
    }

    fn get_target(&self, name: &str) -> Option<TargetInfo> {
        Some(TargetInfo {
            name: name.to_string(),
            ..TargetInfo::local()
        })
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(Option<String>, String)>>,
}

impl Recorder {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send_to_topic(&self, thread_id: Option<&str>, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((thread_id.map(str::to_string), text.to_string()));
        Ok(())
    }

    async fn create_topic_for_task(&self, task: &Task) -> Result<Option<String>, ChannelError> {
        Ok(Some(format!("topic-{}", task.short_id())))
    }
}

/// Registry whose backend is down.
struct DownRegistry;

#[async_trait]
impl MachineRegistry for DownRegistry {
    async fn resolve_machine(&self, _id: &str) -> Result<Machine, RegistryError> {
        Err(RegistryError::Unavailable("registry offline".into()))
    }

    async fn get_machine_for_project(
        &self,
        _project: &str,
    ) -> Result<Option<Machine>, RegistryError> {
        Err(RegistryError::Unavailable("registry offline".into()))
    }

    async fn mark_stale_offline(&self, _threshold: Duration) -> Result<Vec<Machine>, RegistryError> {
        Err(RegistryError::Unavailable("registry offline".into()))
    }

    async fn heartbeat(&self, _machine_id: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unavailable("registry offline".into()))
    }
}

/// libSQL store that rejects every update.
struct UpdateFailingStore {
    inner: Arc<LibSqlBackend>,
}

#[async_trait]
impl TaskStore for UpdateFailingStore {
    async fn claim_next(
        &self,
        orchestrator_id: &str,
        machine_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        self.inner.claim_next(orchestrator_id, machine_id).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn update_task(&self, _id: Uuid, _update: &TaskUpdate) -> Result<(), DatabaseError> {
        Err(DatabaseError::Query("update_task: connection reset".into()))
    }

    async fn list_stale(
        &self,
        statuses: &[TaskStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_stale(statuses, older_than).await
    }

    async fn list_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_queued(older_than).await
    }

    async fn record_orchestrator_heartbeat(
        &self,
        orchestrator_id: &str,
    ) -> Result<(), DatabaseError> {
        self.inner.record_orchestrator_heartbeat(orchestrator_id).await
    }

    async fn orchestrator_last_seen(
        &self,
        orchestrator_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        self.inner.orchestrator_last_seen(orchestrator_id).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

async fn store_with_machine(cap: usize) -> Arc<LibSqlBackend> {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.upsert_machine(&Machine::new(MACHINE, cap).with_engines(["codex", "claude"]))
        .await
        .unwrap();
    db
}

fn config(orchestrator_id: &str, streaming: bool) -> OrchestratorConfig {
    OrchestratorConfig {
        orchestrator_id: orchestrator_id.to_string(),
        machine_id: MACHINE.to_string(),
        streaming,
        update_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}

fn orchestrator(
    db: &Arc<LibSqlBackend>,
    executor: &Arc<StubExecutor>,
    recorder: &Arc<Recorder>,
    config: OrchestratorConfig,
) -> Arc<Orchestrator> {
    let deps = OrchestratorDeps {
        store: db.clone(),
        registry: db.clone(),
        executor: executor.clone(),
        notifier: recorder.clone(),
    };
    Arc::new(Orchestrator::new(config, deps))
}

async fn wait_idle(orch: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while orch.governor().active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks did not finish in time");
}

async fn task(db: &LibSqlBackend, id: Uuid) -> Task {
    db.get_task(id).await.unwrap().unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_task_runs_to_completion() {
    let db = store_with_machine(2).await;
    let executor = Arc::new(StubExecutor::default());
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", true));

    let queued = db
        .insert_task(NewTask::new("itachi-memory", "Add a health check"))
        .await
        .unwrap();

    let TickOutcome::Dispatched(id) = orch.tick().await else {
        panic!("expected a dispatch");
    };
    assert_eq!(id, queued.id);
    wait_idle(&orch).await;

    let done = task(&db, id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.files_changed, vec!["src/lib.rs", "src/main.rs"]);
    assert_eq!(done.orchestrator_id.as_deref(), Some("orch-a"));
    assert_eq!(done.assigned_machine.as_deref(), Some(MACHINE));
    assert_eq!(
        done.notify_thread_id,
        Some(format!("topic-{}", queued.short_id()))
    );
    assert!(
        done.workspace_path
            .unwrap()
            .ends_with(&format!("workspaces/itachi-memory-{}", queued.short_id()))
    );

    // codex is first in the machine's engine list.
    let commands = executor.commands.lock().unwrap().clone();
    assert!(
        commands
            .iter()
            .any(|c| c.contains("itachic --max-budget-usd 5 -p"))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let texts = recorder.texts();
    assert!(texts.iter().any(|t| t.contains("working on it")));
    assert!(texts.iter().any(|t| t.contains("completed (2 files changed)")));

    assert_eq!(orch.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn capacity_gates_claims() {
    let db = store_with_machine(2).await;
    let gate = Arc::new(Semaphore::new(0));
    let executor = Arc::new(StubExecutor {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", false));

    for n in 0..3 {
        db.insert_task(NewTask::new("p", format!("task {n}")))
            .await
            .unwrap();
    }

    assert!(matches!(orch.tick().await, TickOutcome::Dispatched(_)));
    assert!(matches!(orch.tick().await, TickOutcome::Dispatched(_)));
    assert_eq!(orch.tick().await, TickOutcome::AtCapacity);
    assert_eq!(orch.governor().load(MACHINE), 2);

    gate.add_permits(3);
    wait_idle(&orch).await;

    assert!(matches!(orch.tick().await, TickOutcome::Dispatched(_)));
    wait_idle(&orch).await;
    assert_eq!(orch.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn fifty_orchestrators_never_double_claim() {
    let db = store_with_machine(100).await;
    let executor = Arc::new(StubExecutor::default());
    let recorder = Arc::new(Recorder::default());

    let mut ids = HashSet::new();
    for n in 0..20 {
        let task = db
            .insert_task(NewTask::new("p", format!("task {n}")))
            .await
            .unwrap();
        ids.insert(task.id);
    }

    let orchestrators: Vec<Arc<Orchestrator>> = (0..50)
        .map(|n| orchestrator(&db, &executor, &recorder, config(&format!("orch-{n}"), false)))
        .collect();

    let outcomes = futures::future::join_all(orchestrators.iter().map(|o| o.tick())).await;

    let dispatched: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|o| match o {
            TickOutcome::Dispatched(id) => Some(*id),
            _ => None,
        })
        .collect();
    let unique: HashSet<Uuid> = dispatched.iter().copied().collect();
    assert_eq!(dispatched.len(), 20);
    assert_eq!(unique, ids);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == TickOutcome::Idle)
            .count(),
        30
    );

    for orch in &orchestrators {
        wait_idle(orch).await;
    }
    for id in ids {
        assert_eq!(task(&db, id).await.status, TaskStatus::Completed);
    }
}

#[tokio::test]
#[traced_test]
async fn workspace_failure_fails_task_and_loop_continues() {
    let db = store_with_machine(2).await;
    let executor = Arc::new(StubExecutor {
        no_branches: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", true));

    let first = db
        .insert_task(
            NewTask::new("p", "needs develop")
                .with_branch("develop")
                .with_priority(1),
        )
        .await
        .unwrap();
    let second = db.insert_task(NewTask::new("p", "needs main")).await.unwrap();

    assert_eq!(orch.tick().await, TickOutcome::Dispatched(first.id));
    assert_eq!(orch.tick().await, TickOutcome::Dispatched(second.id));
    wait_idle(&orch).await;

    let first = task(&db, first.id).await;
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(
        first.error_message.as_deref(),
        Some("Workspace setup failed: Branch develop not found on remote")
    );

    let second = task(&db, second.id).await;
    assert_eq!(second.status, TaskStatus::Failed);
    assert!(
        second
            .error_message
            .unwrap()
            .contains("(also tried master)")
    );

    assert!(logs_contain("Task failed"));
    assert_eq!(orch.tick().await, TickOutcome::Idle);
}

#[tokio::test]
#[traced_test]
async fn panicking_engine_becomes_failed_update() {
    let db = store_with_machine(1).await;
    let executor = Arc::new(StubExecutor {
        panic_engine: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", false));

    let queued = db.insert_task(NewTask::new("p", "boom")).await.unwrap();
    assert_eq!(orch.tick().await, TickOutcome::Dispatched(queued.id));
    wait_idle(&orch).await;

    let failed = task(&db, queued.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("Task execution panicked: engine wrapper crashed")
    );
    assert!(logs_contain("Task execution panicked"));

    // The slot is free again.
    assert_eq!(orch.governor().load(MACHINE), 0);
    assert_eq!(orch.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn operator_input_and_cancel_reach_the_session() {
    let db = store_with_machine(1).await;
    let executor = Arc::new(StubExecutor {
        hang_sessions: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", true));

    let queued = db.insert_task(NewTask::new("p", "long job")).await.unwrap();
    assert_eq!(orch.tick().await, TickOutcome::Dispatched(queued.id));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !orch
            .governor()
            .get(queued.id)
            .is_some_and(|r| r.has_session())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never attached");

    assert_eq!(task(&db, queued.id).await.status, TaskStatus::Running);

    orch.send_input(queued.id, "yes\n").await.unwrap();
    let control = executor.last_session.lock().unwrap().clone().unwrap();
    assert_eq!(control.inputs.lock().unwrap().clone(), vec!["yes\n"]);

    orch.cancel_task(queued.id).await.unwrap();
    wait_idle(&orch).await;

    let cancelled = task(&db, queued.id).await;
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some("Cancelled by operator")
    );

    assert!(orch.send_input(queued.id, "more").await.is_err());
}

#[tokio::test]
#[traced_test]
async fn failing_registry_exec_and_store_do_not_stop_the_loop() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executor = Arc::new(StubExecutor {
        unreachable: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let deps = OrchestratorDeps {
        store: Arc::new(UpdateFailingStore { inner: db.clone() }),
        registry: Arc::new(DownRegistry),
        executor: executor.clone(),
        notifier: recorder.clone(),
    };
    let orch = Arc::new(Orchestrator::new(config("orch-a", false), deps));

    let first = db
        .insert_task(NewTask::new("p", "first").with_priority(1))
        .await
        .unwrap();
    let second = db.insert_task(NewTask::new("p", "second")).await.unwrap();

    assert_eq!(orch.tick().await, TickOutcome::Dispatched(first.id));
    wait_idle(&orch).await;

    assert!(logs_contain("Registry unavailable, using configured cap"));
    assert!(logs_contain("Could not resolve machine"));
    assert!(logs_contain("Workspace setup failed"));
    assert!(logs_contain("Failed to persist terminal status"));

    // The failed update leaves the task for stale recovery.
    assert_eq!(task(&db, first.id).await.status, TaskStatus::Claimed);
    assert_eq!(orch.governor().load(MACHINE), 0);

    assert_eq!(orch.tick().await, TickOutcome::Dispatched(second.id));
    wait_idle(&orch).await;
}

async fn wait_running(db: &LibSqlBackend, id: Uuid) -> Task {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = task(db, id).await;
            if task.status == TaskStatus::Running {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started running")
}

#[tokio::test]
async fn affinity_routing_respects_target_capacity() {
    let db = store_with_machine(2).await;
    db.upsert_machine(
        &Machine::new("win", 1)
            .with_engines(["gemini"])
            .with_projects(["site"]),
    )
    .await
    .unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let executor = Arc::new(StubExecutor {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(&db, &executor, &recorder, config("orch-a", false));

    let first = db
        .insert_task(NewTask::new("site", "first").with_priority(1))
        .await
        .unwrap();
    let second = db.insert_task(NewTask::new("site", "second")).await.unwrap();

    assert_eq!(orch.tick().await, TickOutcome::Dispatched(first.id));
    let routed = wait_running(&db, first.id).await;
    assert_eq!(routed.assigned_machine.as_deref(), Some("win"));
    assert_eq!(orch.governor().load("win"), 1);
    assert_eq!(orch.governor().load(MACHINE), 0);

    // win is full, so the second task stays where it was claimed.
    assert_eq!(orch.tick().await, TickOutcome::Dispatched(second.id));
    let local = wait_running(&db, second.id).await;
    assert_eq!(local.assigned_machine.as_deref(), Some(MACHINE));
    assert_eq!(orch.governor().load("win"), 1);
    assert_eq!(orch.governor().load(MACHINE), 1);

    gate.add_permits(2);
    wait_idle(&orch).await;
    assert_eq!(task(&db, first.id).await.status, TaskStatus::Completed);
    assert_eq!(task(&db, second.id).await.status, TaskStatus::Completed);

    let commands = executor.commands.lock().unwrap().clone();
    assert!(commands.iter().any(|c| c.contains("itachig --max-budget-usd")));
    assert!(commands.iter().any(|c| c.contains("itachic --max-budget-usd")));
}
