//! Executes one claimed task to a terminal status.
//!
//! The execution body runs on an inner tokio task so that a panic is
//! observed as a `JoinError` and still produces a `failed` update.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, warn};

use crate::exec::shell::{cd_and, quote};
use crate::exec::{Platform, SessionEvent, clean_output};
use crate::machines::{DEFAULT_WRAPPER, EngineWrapper, resolve_engine};
use crate::tasks::{Task, TaskUpdate};
use crate::workspace::Workspace;

use super::governor::ActiveTaskGuard;
use super::orchestrator::Orchestrator;

/// Buffered engine output is posted once it reaches this many chars.
const STREAM_FLUSH_CHARS: usize = 3000;

/// Longest escape sequence held back between flushes.
const MAX_PENDING_ESCAPE: usize = 256;

/// Most files listed in a completion notice.
const MAX_LISTED_FILES: usize = 20;

/// Final result of an execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Outcome {
    Completed { files_changed: Vec<String> },
    Failed(String),
}

/// Where and with what a task runs.
#[derive(Debug, Clone)]
struct Placement {
    target: String,
    engine: EngineWrapper,
}

pub(super) async fn run_task(orch: Arc<Orchestrator>, task: Task, guard: ActiveTaskGuard) {
    let started = Instant::now();

    let body = {
        let orch = Arc::clone(&orch);
        let task = task.clone();
        tokio::spawn(async move { execute(&orch, &task).await }.in_current_span())
    };

    let outcome = match body.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            error!(reason = %reason, "Task execution panicked");
            Outcome::Failed(format!("Task execution panicked: {reason}"))
        }
        Err(e) => Outcome::Failed(format!("Task execution aborted: {e}")),
    };

    finish(&orch, &task, outcome, guard, started.elapsed()).await;
}

async fn execute(orch: &Orchestrator, task: &Task) -> Outcome {
    let placement = place(orch, task).await;
    let platform = orch.deps.executor.platform(&placement.target);
    info!(
        exec_target = %placement.target,
        engine = placement.engine.engine,
        "Executing task"
    );

    let thread = ensure_topic(orch, task).await;
    orch.notify.notify(
        thread.clone(),
        format!(
            "Task {} started on {} ({})",
            task.short_id(),
            placement.target,
            placement.engine.engine
        ),
    );

    let workspace = match orch.provisioner.provision(&placement.target, task).await {
        Ok(ws) => ws,
        Err(e) => return Outcome::Failed(format!("Workspace setup failed: {e}")),
    };

    let running = TaskUpdate::running(workspace.path.clone())
        .owned_by(orch.config.orchestrator_id.clone())
        .on_machine(placement.target.clone());
    if let Err(e) = orch.deps.store.update_task(task.id, &running).await {
        return Outcome::Failed(format!("Failed to mark task running: {e}"));
    }

    if orch.governor.is_cancel_requested(task.id) {
        return Outcome::Failed("Cancelled before the engine started".to_string());
    }

    let command = engine_command(platform, &placement.engine, task, &workspace.path);
    debug!(command = %command, "Engine command");

    let outcome = if orch.config.streaming {
        run_streaming(orch, task, &placement.target, &command, thread.as_deref()).await
    } else {
        run_sync(orch, task, &placement.target, &command, thread.as_deref()).await
    };

    match outcome {
        Ok(()) => Outcome::Completed {
            files_changed: collect_files_changed(orch, &placement.target, platform, &workspace)
                .await,
        },
        Err(reason) => Outcome::Failed(reason),
    }
}

/// Choose the execution target and engine wrapper.
///
/// The claiming machine runs the task unless it lacks a checkout of the
/// project and another reachable machine has one with a free slot. The
/// task's slot then moves to that machine.
async fn place(orch: &Orchestrator, task: &Task) -> Placement {
    let claimed_on = task
        .assigned_machine
        .clone()
        .unwrap_or_else(|| orch.config.machine_id.clone());
    let registry = &orch.deps.registry;

    let machine = match registry.resolve_machine(&claimed_on).await {
        Ok(machine) => machine,
        Err(e) => {
            warn!(machine_id = %claimed_on, error = %e, "Could not resolve machine, using default engine");
            return Placement {
                target: claimed_on,
                engine: DEFAULT_WRAPPER,
            };
        }
    };

    if !machine.serves_project(&task.project) {
        match registry.get_machine_for_project(&task.project).await {
            Ok(Some(other)) if orch.deps.executor.get_target(&other.id).is_some() => {
                match orch.governor.try_reserve(&other.id, other.max_concurrent) {
                    Some(slot) => {
                        slot.transfer(task.id);
                        info!(
                            from = %machine.id,
                            to = %other.id,
                            project = %task.project,
                            "Routing task to machine with project checkout"
                        );
                        return Placement {
                            target: other.id.clone(),
                            engine: resolve_engine(&other.engine_priority),
                        };
                    }
                    None => info!(
                        machine_id = %other.id,
                        project = %task.project,
                        "Project machine at capacity, running on claiming machine"
                    ),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(project = %task.project, error = %e, "Project affinity lookup failed"),
        }
    }

    Placement {
        engine: resolve_engine(&machine.engine_priority),
        target: machine.id,
    }
}

/// The task's notification thread, creating a topic if it has none.
async fn ensure_topic(orch: &Orchestrator, task: &Task) -> Option<String> {
    if let Some(thread) = orch.governor.thread_id(task.id) {
        return Some(thread);
    }

    let thread = orch.notify.create_topic(task).await?;
    orch.governor.set_thread(task.id, Some(thread.clone()));

    let update = TaskUpdate {
        notify_thread_id: Some(thread.clone()),
        ..Default::default()
    };
    if let Err(e) = orch.deps.store.update_task(task.id, &update).await {
        warn!(error = %e, "Failed to persist notification thread");
    }
    Some(thread)
}

/// `cd <workspace> && <wrapper> [--model m] --max-budget-usd <n> -p <prompt>`.
fn engine_command(
    platform: Platform,
    engine: &EngineWrapper,
    task: &Task,
    workspace_path: &str,
) -> String {
    let mut invocation = engine.command.to_string();
    if let Some(model) = &task.model {
        invocation.push_str(&format!(" --model {}", quote(model, platform)));
    }
    invocation.push_str(&format!(
        " --max-budget-usd {} -p {}",
        task.max_budget_usd.normalize(),
        quote(&task.description, platform)
    ));
    cd_and(platform, workspace_path, &invocation)
}

async fn run_streaming(
    orch: &Orchestrator,
    task: &Task,
    target: &str,
    command: &str,
    thread: Option<&str>,
) -> Result<(), String> {
    let timeout = orch.config.task_timeout;
    let started = Instant::now();
    let session = orch
        .deps
        .executor
        .spawn_session(target, command, timeout)
        .await
        .map_err(|e| format!("Failed to start engine: {e}"))?;

    orch.governor
        .attach_session(task.id, Arc::clone(&session.control));
    // Cancel may have landed before the attach.
    if orch.governor.is_cancel_requested(task.id) {
        if let Err(e) = session.control.kill().await {
            warn!(error = %e, "Failed to kill cancelled session");
        }
    }

    let mut events = session.events;
    let mut buffer = String::new();
    let mut stderr_tail = String::new();
    let mut flush = tokio::time::interval(orch.config.stream_flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush.tick().await;

    let exit = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Stdout(chunk)) => {
                    buffer.push_str(&chunk);
                    if buffer.len() >= STREAM_FLUSH_CHARS {
                        flush_output(orch, thread, &mut buffer);
                    }
                }
                Some(SessionEvent::Stderr(chunk)) => {
                    stderr_tail.push_str(&chunk);
                    keep_tail(&mut stderr_tail, 2048);
                }
                Some(SessionEvent::Exit(code)) => break code,
                None => break None,
            },
            _ = flush.tick() => flush_output(orch, thread, &mut buffer),
        }
    };
    post_output(orch, thread, &mut buffer);

    match exit {
        Some(0) => Ok(()),
        Some(code) => Err(match last_line(&stderr_tail) {
            Some(line) => format!("Engine exited with code {code}: {line}"),
            None => format!("Engine exited with code {code}"),
        }),
        None if orch.governor.is_cancel_requested(task.id) => {
            Err("Cancelled by operator".to_string())
        }
        None if started.elapsed() >= timeout => Err(format!("Engine timed out after {timeout:?}")),
        None => Err("Engine session terminated without an exit code".to_string()),
    }
}

async fn run_sync(
    orch: &Orchestrator,
    task: &Task,
    target: &str,
    command: &str,
    thread: Option<&str>,
) -> Result<(), String> {
    let timeout = orch.config.task_timeout;
    let output = orch
        .deps
        .executor
        .exec(target, command, timeout)
        .await
        .map_err(|e| format!("Engine execution failed: {e}"))?;

    if output.timed_out {
        return Err(format!("Engine timed out after {timeout:?}"));
    }
    if orch.governor.is_cancel_requested(task.id) {
        return Err("Cancelled by operator".to_string());
    }

    let mut stdout = output.stdout.clone();
    post_output(orch, thread, &mut stdout);

    if output.success {
        Ok(())
    } else {
        Err(format!(
            "Engine exited with code {}: {}",
            output
                .exit_code
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            output.failure_summary()
        ))
    }
}

/// Post buffered output, keeping back a trailing escape sequence that the
/// next chunk may complete.
fn flush_output(orch: &Orchestrator, thread: Option<&str>, buffer: &mut String) {
    let pending = buffer.split_off(complete_prefix_len(buffer));
    post_output(orch, thread, buffer);
    *buffer = pending;
}

/// Post all buffered output to the thread and clear the buffer.
fn post_output(orch: &Orchestrator, thread: Option<&str>, buffer: &mut String) {
    let text = clean_output(buffer);
    buffer.clear();
    if !text.is_empty() {
        orch.notify.notify(thread.map(str::to_string), text);
    }
}

/// Length of `buffer` without a trailing, possibly incomplete, escape.
fn complete_prefix_len(buffer: &str) -> usize {
    let Some(start) = buffer.rfind('\x1b') else {
        return buffer.len();
    };
    let tail = &buffer.as_bytes()[start..];
    if tail.len() > MAX_PENDING_ESCAPE {
        return buffer.len();
    }
    let complete = match tail.get(1).copied() {
        None => false,
        Some(b'[') => tail[2..].iter().any(|b| (0x40..=0x7e).contains(b)),
        Some(b']') => tail.contains(&0x07),
        Some(b'(' | b')' | b'*' | b'+') => tail.len() >= 3,
        Some(_) => true,
    };
    if complete { buffer.len() } else { start }
}

/// Files that differ from the base branch, in git's order, without duplicates.
async fn collect_files_changed(
    orch: &Orchestrator,
    target: &str,
    platform: Platform,
    workspace: &Workspace,
) -> Vec<String> {
    let base = format!("origin/{}", workspace.base_branch);
    let command = cd_and(
        platform,
        &workspace.path,
        &format!("git diff --name-only {}", quote(&base, platform)),
    );

    match orch
        .deps
        .executor
        .exec(target, &command, orch.config.exec_timeout)
        .await
    {
        Ok(out) if out.success => parse_file_list(&out.stdout),
        Ok(out) => {
            warn!(reason = %out.failure_summary(), "Could not list changed files");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Could not list changed files");
            Vec::new()
        }
    }
}

fn parse_file_list(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !files.iter().any(|f| f == line) {
            files.push(line.to_string());
        }
    }
    files
}

/// Persist the terminal status, release the record, then notify.
async fn finish(
    orch: &Orchestrator,
    task: &Task,
    outcome: Outcome,
    guard: ActiveTaskGuard,
    elapsed: Duration,
) {
    let update = match &outcome {
        Outcome::Completed { files_changed } => TaskUpdate::completed(files_changed.clone()),
        Outcome::Failed(reason) => TaskUpdate::failed(reason.clone()),
    }
    .owned_by(orch.config.orchestrator_id.clone());

    let persisted = persist_terminal(orch, task, &update).await;
    let thread = orch
        .governor
        .thread_id(task.id)
        .or_else(|| task.notify_thread_id.clone());
    drop(guard);

    match &outcome {
        Outcome::Completed { files_changed } => {
            info!(
                files = files_changed.len(),
                elapsed_secs = elapsed.as_secs(),
                persisted,
                "Task completed"
            );
            orch.notify.notify(thread, completion_message(task, files_changed));
        }
        Outcome::Failed(reason) => {
            warn!(
                reason = %reason,
                elapsed_secs = elapsed.as_secs(),
                persisted,
                "Task failed"
            );
            orch.notify.notify(
                thread,
                format!("Task {} failed: {reason}", task.short_id()),
            );
        }
    }
}

/// Write a terminal update, retrying retryable errors with backoff.
async fn persist_terminal(orch: &Orchestrator, task: &Task, update: &TaskUpdate) -> bool {
    let attempts = orch.config.update_attempts.max(1);
    let mut delay = orch.config.update_backoff;

    for attempt in 1..=attempts {
        match orch.deps.store.update_task(task.id, update).await {
            Ok(()) => return true,
            Err(e) if e.is_retryable() && attempt < attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                warn!(attempt, error = %e, "Terminal update failed, retrying");
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay *= 2;
            }
            Err(e) => {
                error!(attempt, status = ?update.status, error = %e, "Failed to persist terminal status");
                return false;
            }
        }
    }
    false
}

fn completion_message(task: &Task, files: &[String]) -> String {
    let mut text = format!(
        "Task {} completed ({} file{} changed)",
        task.short_id(),
        files.len(),
        if files.len() == 1 { "" } else { "s" }
    );
    for file in files.iter().take(MAX_LISTED_FILES) {
        text.push_str("\n- ");
        text.push_str(file);
    }
    if files.len() > MAX_LISTED_FILES {
        text.push_str(&format!("\n… and {} more", files.len() - MAX_LISTED_FILES));
    }
    text
}

fn last_line(text: &str) -> Option<String> {
    clean_output(text)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Drop leading bytes so `text` is at most about `max` bytes.
fn keep_tail(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
