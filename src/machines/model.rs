//! Machine data model.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A heartbeat older than this means the machine is unreachable,
/// whatever its status flag says.
pub const LIVENESS_THRESHOLD: Duration = Duration::from_secs(60);

/// Recorded availability of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Online,
    Offline,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl FromStr for MachineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown machine status: {other}")),
        }
    }
}

/// An execution target registered in the machine registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Stable machine id; also the execution target name.
    pub id: String,
    /// Preferred engines, most preferred first.
    #[serde(default)]
    pub engine_priority: Vec<String>,
    /// Maximum tasks this machine runs at once.
    pub max_concurrent: usize,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    pub status: MachineStatus,
    /// Projects this machine has checkouts for.
    #[serde(default)]
    pub projects: Vec<String>,
}

impl Machine {
    /// Create an online machine with a fresh heartbeat.
    pub fn new(id: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            id: id.into(),
            engine_priority: Vec::new(),
            max_concurrent,
            last_heartbeat: Utc::now(),
            status: MachineStatus::Online,
            projects: Vec::new(),
        }
    }

    /// Builder: set engine priority.
    pub fn with_engines<I, S>(mut self, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine_priority = engines.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set project affinity.
    pub fn with_projects<I, S>(mut self, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projects = projects.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the heartbeat is older than `threshold` at `now`.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.to_std().map(|age| age > threshold).unwrap_or(false)
    }

    /// Online and heartbeating within `threshold`.
    pub fn is_reachable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == MachineStatus::Online && !self.heartbeat_expired(now, threshold)
    }

    /// Whether the machine has a checkout of `project`.
    pub fn serves_project(&self, project: &str) -> bool {
        self.projects.iter().any(|p| p == project)
    }
}
