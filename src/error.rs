//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether retrying the same call could succeed.
    ///
    /// Constraint and not-found failures are deterministic; everything else
    /// is treated as a communication problem.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Constraint(_) | Self::NotFound { .. } | Self::Serialization(_)
        )
    }
}

/// Machine registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Machine {0} not found")]
    NotFound(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Remote execution errors.
///
/// A command that runs and exits non-zero is not an error; see
/// [`crate::exec::ExecOutput`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Unknown execution target: {0}")]
    UnknownTarget(String),

    #[error("Target {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("Failed to spawn command on {target}: {reason}")]
    SpawnFailed { target: String, reason: String },

    #[error("Session on {target} is closed")]
    SessionClosed { target: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Branch {branch} not found on remote (also tried {fallback})")]
    BranchMissing { branch: String, fallback: String },

    #[error("Branch {0} not found on remote")]
    ExplicitBranchMissing(String),

    #[error("Workspace step '{step}' failed: {detail}")]
    StepFailed { step: String, detail: String },

    #[error("Workspace step '{step}' timed out after {timeout:?}")]
    StepTimedOut { step: String, timeout: Duration },

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to create topic on channel {name}: {reason}")]
    TopicFailed { name: String, reason: String },

    #[error("Invalid callback data: {0}")]
    InvalidCallback(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} is not active in this orchestrator")]
    NotActive { id: Uuid },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
