//! Task data model: status machine, persisted task, and partial updates.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default budget ceiling for a task, in USD.
pub const DEFAULT_BUDGET_USD: Decimal = Decimal::from_parts(500, 0, 0, false, 2);

/// Default target branch when a task does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by an orchestrator, workspace not yet ready.
    Claimed,
    /// Engine is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, or abandoned and recovered.
    Failed,
}

impl TaskStatus {
    /// Check if this status may move to `target`.
    ///
    /// Progression is strictly forward. `Claimed → Failed` covers both
    /// workspace setup failures and stale recovery.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Claimed)
                | (Claimed, Running)
                | (Claimed, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Statuses from which `self` can be reached.
    pub fn predecessors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;

        match self {
            Queued => &[],
            Claimed => &[Queued],
            Running => &[Claimed],
            Completed => &[Running],
            Failed => &[Claimed, Running],
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if an orchestrator currently holds the task.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// First 8 characters of a task id, used in paths, branches and callbacks.
pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable ID.
    pub id: Uuid,
    /// Project (repository) name.
    pub project: String,
    /// Free-text instructions for the engine.
    pub description: String,
    /// Target branch the work is based on.
    pub branch: String,
    /// Source repository to clone. When absent the project checkout is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Higher = more urgent.
    pub priority: i32,
    /// Model / engine hint passed through to the wrapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Budget ceiling in USD.
    pub max_budget_usd: Decimal,
    /// Machine the task was claimed for or runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_machine: Option<String>,
    /// Workspace path on the executing machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    /// Orchestrator holding the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Files touched by the engine, in reporting order.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Originating chat.
    pub chat_id: String,
    /// Requesting user.
    pub user_id: String,
    /// Notification thread (forum topic) for status updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Short id (first 8 chars of the UUID).
    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    /// Time the current holder took responsibility for the task.
    ///
    /// Falls back from `started_at` to `claimed_at` to `created_at`.
    pub fn held_since(&self) -> DateTime<Utc> {
        self.started_at
            .or(self.claimed_at)
            .unwrap_or(self.created_at)
    }
}

/// Input for creating a queued task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project: String,
    pub description: String,
    pub branch: String,
    pub repo_url: Option<String>,
    pub priority: i32,
    pub model: Option<String>,
    pub max_budget_usd: Decimal,
    pub assigned_machine: Option<String>,
    pub chat_id: String,
    pub user_id: String,
    pub notify_thread_id: Option<String>,
}

impl NewTask {
    /// Create a new task description with sensible defaults.
    pub fn new(project: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            description: description.into(),
            branch: DEFAULT_BRANCH.to_string(),
            repo_url: None,
            priority: 0,
            model: None,
            max_budget_usd: DEFAULT_BUDGET_USD,
            assigned_machine: None,
            chat_id: String::new(),
            user_id: String::new(),
            notify_thread_id: None,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set target branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Builder: set source repository.
    pub fn with_repo_url(mut self, url: impl Into<String>) -> Self {
        self.repo_url = Some(url.into());
        self
    }

    /// Builder: set budget ceiling.
    pub fn with_budget(mut self, budget: Decimal) -> Self {
        self.max_budget_usd = budget;
        self
    }

    /// Builder: pin to a machine.
    pub fn with_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.assigned_machine = Some(machine_id.into());
        self
    }

    /// Builder: set routing info.
    pub fn with_origin(mut self, chat_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self.user_id = user_id.into();
        self
    }

    /// Materialise into a queued task.
    pub fn into_task(self) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project: self.project,
            description: self.description,
            branch: self.branch,
            repo_url: self.repo_url,
            status: TaskStatus::Queued,
            priority: self.priority,
            model: self.model,
            max_budget_usd: self.max_budget_usd,
            assigned_machine: self.assigned_machine,
            workspace_path: None,
            orchestrator_id: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            files_changed: Vec::new(),
            chat_id: self.chat_id,
            user_id: self.user_id,
            notify_thread_id: self.notify_thread_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by [`crate::store::TaskStore::update_task`].
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assigned_machine: Option<String>,
    pub workspace_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub notify_thread_id: Option<String>,
    /// Only apply when the task is held by this orchestrator.
    pub owner_guard: Option<String>,
}

impl TaskUpdate {
    /// Transition to `running` in `workspace_path`.
    pub fn running(workspace_path: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            workspace_path: Some(workspace_path.into()),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Transition to `completed`.
    pub fn completed(files_changed: Vec<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            completed_at: Some(Utc::now()),
            files_changed: Some(files_changed),
            ..Default::default()
        }
    }

    /// Transition to `failed` with a reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            completed_at: Some(Utc::now()),
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    /// Builder: restrict the update to tasks held by `orchestrator_id`.
    pub fn owned_by(mut self, orchestrator_id: impl Into<String>) -> Self {
        self.owner_guard = Some(orchestrator_id.into());
        self
    }

    /// Builder: record the executing machine.
    pub fn on_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.assigned_machine = Some(machine_id.into());
        self
    }

    /// True if nothing would be written.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assigned_machine.is_none()
            && self.workspace_path.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.error_message.is_none()
            && self.files_changed.is_none()
            && self.notify_thread_id.is_none()
    }
}
