//! libSQL backend implementing [`TaskStore`] and [`MachineRegistry`].
//!
//! Claims are a single `UPDATE ... RETURNING` whose `WHERE` re-checks
//! `status = 'queued'`, so two orchestrators racing for the same row
//! cannot both win it.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, RegistryError};
use crate::machines::{LIVENESS_THRESHOLD, Machine, MachineStatus};
use crate::store::migrations;
use crate::store::traits::{MachineRegistry, TaskStore};
use crate::tasks::{NewTask, Task, TaskStatus, TaskUpdate};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Enqueue a new task.
    pub async fn insert_task(&self, new: NewTask) -> Result<Task, DatabaseError> {
        let task = new.into_task();
        self.put_task(&task).await?;
        debug!(task_id = %task.id, project = %task.project, "Task queued");
        Ok(task)
    }

    /// Insert a fully-formed task row as is.
    pub async fn put_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let files = serde_json::to_string(&task.files_changed)
            .map_err(|e| DatabaseError::Serialization(format!("files_changed: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
                ),
                params![
                    task.id.to_string(),
                    task.project.as_str(),
                    task.description.as_str(),
                    task.branch.as_str(),
                    opt_text(task.repo_url.as_deref()),
                    task.status.as_str(),
                    task.priority as i64,
                    opt_text(task.model.as_deref()),
                    task.max_budget_usd.to_string(),
                    opt_text(task.assigned_machine.as_deref()),
                    opt_text(task.workspace_path.as_deref()),
                    opt_text(task.orchestrator_id.as_deref()),
                    opt_ts(task.claimed_at),
                    opt_ts(task.started_at),
                    opt_ts(task.completed_at),
                    opt_text(task.error_message.as_deref()),
                    files,
                    task.chat_id.as_str(),
                    task.user_id.as_str(),
                    opt_text(task.notify_thread_id.as_deref()),
                    ts(task.created_at),
                    ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        Ok(())
    }

    /// Register a machine, replacing any existing row with the same id.
    pub async fn upsert_machine(&self, machine: &Machine) -> Result<(), DatabaseError> {
        let engines = serde_json::to_string(&machine.engine_priority)
            .map_err(|e| DatabaseError::Serialization(format!("engine_priority: {e}")))?;
        let projects = serde_json::to_string(&machine.projects)
            .map_err(|e| DatabaseError::Serialization(format!("projects: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO machines (id, engine_priority, max_concurrent, last_heartbeat, status, projects)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    engine_priority = excluded.engine_priority,
                    max_concurrent = excluded.max_concurrent,
                    last_heartbeat = excluded.last_heartbeat,
                    status = excluded.status,
                    projects = excluded.projects",
                params![
                    machine.id.as_str(),
                    engines,
                    machine.max_concurrent as i64,
                    ts(machine.last_heartbeat),
                    machine.status.as_str(),
                    projects,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_machine: {e}")))?;
        Ok(())
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_task(&row) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!("Skipping task row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn query_machines(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Machine>, RegistryError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| RegistryError::Unavailable(format!("{op}: {e}")))?;

        let mut machines = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_machine(&row) {
                    Ok(machine) => machines.push(machine),
                    Err(e) => warn!("Skipping machine row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(RegistryError::Unavailable(format!("{op}: {e}"))),
            }
        }
        Ok(machines)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, project, description, branch, repo_url, status, priority, model, \
     max_budget_usd, assigned_machine, workspace_path, orchestrator_id, claimed_at, started_at, \
     completed_at, error_message, files_changed, chat_id, user_id, notify_thread_id, created_at, \
     updated_at";

const MACHINE_COLUMNS: &str =
    "id, engine_priority, max_concurrent, last_heartbeat, status, projects";

/// Canonical timestamp format. Fixed width, so text order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn text(s: impl Into<String>) -> libsql::Value {
    libsql::Value::Text(s.into())
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Map a libsql Row (in `TASK_COLUMNS` order) to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(row_err)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id {id_str}: {e}")))?;
    let status_str: String = row.get(5).map_err(row_err)?;
    let status = TaskStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;
    let budget_str: String = row.get(8).map_err(row_err)?;
    let max_budget_usd = Decimal::from_str(&budget_str)
        .map_err(|e| DatabaseError::Serialization(format!("max_budget_usd {budget_str}: {e}")))?;
    let files_str: String = row.get(16).map_err(row_err)?;
    let files_changed: Vec<String> = serde_json::from_str(&files_str)
        .map_err(|e| DatabaseError::Serialization(format!("files_changed: {e}")))?;
    let created_str: String = row.get(20).map_err(row_err)?;
    let updated_str: String = row.get(21).map_err(row_err)?;

    Ok(Task {
        id,
        project: row.get(1).map_err(row_err)?,
        description: row.get(2).map_err(row_err)?,
        branch: row.get(3).map_err(row_err)?,
        repo_url: row.get(4).map_err(row_err)?,
        status,
        priority: row.get::<i64>(6).map_err(row_err)? as i32,
        model: row.get(7).map_err(row_err)?,
        max_budget_usd,
        assigned_machine: row.get(9).map_err(row_err)?,
        workspace_path: row.get(10).map_err(row_err)?,
        orchestrator_id: row.get(11).map_err(row_err)?,
        claimed_at: parse_optional_datetime(row.get(12).map_err(row_err)?),
        started_at: parse_optional_datetime(row.get(13).map_err(row_err)?),
        completed_at: parse_optional_datetime(row.get(14).map_err(row_err)?),
        error_message: row.get(15).map_err(row_err)?,
        files_changed,
        chat_id: row.get(17).map_err(row_err)?,
        user_id: row.get(18).map_err(row_err)?,
        notify_thread_id: row.get(19).map_err(row_err)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row (in `MACHINE_COLUMNS` order) to a Machine.
fn row_to_machine(row: &libsql::Row) -> Result<Machine, DatabaseError> {
    let engines_str: String = row.get(1).map_err(row_err)?;
    let heartbeat_str: String = row.get(3).map_err(row_err)?;
    let status_str: String = row.get(4).map_err(row_err)?;
    let projects_str: String = row.get(5).map_err(row_err)?;

    Ok(Machine {
        id: row.get(0).map_err(row_err)?,
        engine_priority: serde_json::from_str(&engines_str)
            .map_err(|e| DatabaseError::Serialization(format!("engine_priority: {e}")))?,
        max_concurrent: row.get::<i64>(2).map_err(row_err)?.max(0) as usize,
        last_heartbeat: parse_datetime(&heartbeat_str),
        status: MachineStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?,
        projects: serde_json::from_str(&projects_str)
            .map_err(|e| DatabaseError::Serialization(format!("projects: {e}")))?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn claim_next(
        &self,
        orchestrator_id: &str,
        machine_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = ts(Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks
                     SET status = 'claimed', orchestrator_id = ?1, assigned_machine = ?2,
                         claimed_at = ?3, updated_at = ?3
                     WHERE id = (
                         SELECT id FROM tasks
                         WHERE status = 'queued'
                           AND (assigned_machine IS NULL OR assigned_machine = ?2)
                         ORDER BY priority DESC, created_at ASC
                         LIMIT 1
                     )
                     AND status = 'queued'
                     RETURNING {TASK_COLUMNS}"
                ),
                params![orchestrator_id, machine_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next: {e}"))),
        }
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), DatabaseError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(text(status.as_str()));
        }
        if let Some(machine) = &update.assigned_machine {
            sets.push("assigned_machine = ?");
            values.push(text(machine.as_str()));
        }
        if let Some(path) = &update.workspace_path {
            sets.push("workspace_path = ?");
            values.push(text(path.as_str()));
        }
        if let Some(at) = update.started_at {
            sets.push("started_at = ?");
            values.push(text(ts(at)));
        }
        if let Some(at) = update.completed_at {
            sets.push("completed_at = ?");
            values.push(text(ts(at)));
        }
        if let Some(error) = &update.error_message {
            sets.push("error_message = ?");
            values.push(text(error.as_str()));
        }
        if let Some(files) = &update.files_changed {
            let json = serde_json::to_string(files)
                .map_err(|e| DatabaseError::Serialization(format!("files_changed: {e}")))?;
            sets.push("files_changed = ?");
            values.push(text(json));
        }
        if let Some(thread) = &update.notify_thread_id {
            sets.push("notify_thread_id = ?");
            values.push(text(thread.as_str()));
        }
        sets.push("updated_at = ?");
        values.push(text(ts(Utc::now())));

        let mut sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        values.push(text(id.to_string()));

        if let Some(status) = update.status {
            let allowed = status.predecessors();
            if allowed.is_empty() {
                return Err(DatabaseError::Constraint(format!(
                    "task {id} cannot move back to {status}"
                )));
            }
            sql.push_str(&format!(" AND status IN ({})", placeholders(allowed.len())));
            values.extend(allowed.iter().map(|s| text(s.as_str())));
        }
        if let Some(owner) = &update.owner_guard {
            sql.push_str(" AND orchestrator_id = ?");
            values.push(text(owner.as_str()));
        }

        let affected = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        if affected > 0 {
            return Ok(());
        }

        match self.get_task(id).await? {
            None => Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: id.to_string(),
            }),
            Some(current) => Err(DatabaseError::Constraint(format!(
                "update rejected for task {id}: status is {}, held by {}",
                current.status,
                current.orchestrator_id.as_deref().unwrap_or("nobody")
            ))),
        }
    }

    async fn list_stale(
        &self,
        statuses: &[TaskStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status IN ({})
               AND COALESCE(started_at, claimed_at, created_at) < ?
             ORDER BY COALESCE(started_at, claimed_at, created_at) ASC",
            placeholders(statuses.len())
        );
        let mut values: Vec<libsql::Value> =
            statuses.iter().map(|s| text(s.as_str())).collect();
        values.push(text(ts(older_than)));

        self.query_tasks("list_stale", &sql, values).await
    }

    async fn list_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'queued' AND assigned_machine IS NULL AND created_at < ?
             ORDER BY created_at ASC"
        );
        self.query_tasks("list_queued", &sql, vec![text(ts(older_than))])
            .await
    }

    async fn record_orchestrator_heartbeat(
        &self,
        orchestrator_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO orchestrators (id, last_seen) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
                params![orchestrator_id, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_orchestrator_heartbeat: {e}")))?;
        Ok(())
    }

    async fn orchestrator_last_seen(
        &self,
        orchestrator_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_seen FROM orchestrators WHERE id = ?1",
                params![orchestrator_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("orchestrator_last_seen: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let seen: String = row.get(0).map_err(row_err)?;
                Ok(Some(parse_datetime(&seen)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("orchestrator_last_seen: {e}"))),
        }
    }
}

#[async_trait]
impl MachineRegistry for LibSqlBackend {
    async fn resolve_machine(&self, id: &str) -> Result<Machine, RegistryError> {
        let sql = format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?");
        self.query_machines("resolve_machine", &sql, vec![text(id)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn get_machine_for_project(
        &self,
        project: &str,
    ) -> Result<Option<Machine>, RegistryError> {
        let sql = format!(
            "SELECT {MACHINE_COLUMNS} FROM machines WHERE status = 'online' ORDER BY last_heartbeat DESC"
        );
        let now = Utc::now();
        Ok(self
            .query_machines("get_machine_for_project", &sql, Vec::new())
            .await?
            .into_iter()
            .find(|m| m.serves_project(project) && m.is_reachable(now, LIVENESS_THRESHOLD)))
    }

    async fn mark_stale_offline(&self, threshold: Duration) -> Result<Vec<Machine>, RegistryError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| RegistryError::Unavailable(format!("invalid threshold: {e}")))?;
        let cutoff = ts(Utc::now() - threshold);

        let sql = format!(
            "UPDATE machines SET status = 'offline'
             WHERE status = 'online' AND last_heartbeat < ?
             RETURNING {MACHINE_COLUMNS}"
        );
        let changed = self
            .query_machines("mark_stale_offline", &sql, vec![text(cutoff)])
            .await?;
        for machine in &changed {
            info!(machine_id = %machine.id, "Machine heartbeat expired, marked offline");
        }
        Ok(changed)
    }

    async fn heartbeat(&self, machine_id: &str) -> Result<(), RegistryError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE machines SET last_heartbeat = ?1, status = 'online' WHERE id = ?2",
                params![ts(Utc::now()), machine_id],
            )
            .await
            .map_err(|e| RegistryError::Unavailable(format!("heartbeat: {e}")))?;

        if affected == 0 {
            return Err(RegistryError::NotFound(machine_id.to_string()));
        }
        Ok(())
    }
}
