//! Remote execution: run commands on named targets.
//!
//! Two modes:
//! - `exec()` runs to completion with a timeout and captures output
//! - `spawn_session()` starts a long-lived session streaming output as
//!   [`SessionEvent`]s, with input injection and forced termination
//!
//! A command that exits non-zero or times out is a normal [`ExecOutput`];
//! only an unknown or unreachable target is an [`ExecError`].

pub mod sanitize;
pub mod shell;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ExecError;

pub use sanitize::clean_output;
pub use ssh::SshExecutor;

/// Name of the target that runs commands on this host.
pub const LOCAL_TARGET: &str = "local";

/// Shell and path conventions of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

/// Connection info for an execution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub platform: Platform,
}

impl TargetInfo {
    /// The built-in target for this host.
    pub fn local() -> Self {
        Self {
            name: LOCAL_TARGET.to_string(),
            host: "localhost".to_string(),
            user: None,
            port: None,
            platform: if cfg!(target_os = "windows") {
                Platform::Windows
            } else {
                Platform::Unix
            },
        }
    }

    pub fn is_local(&self) -> bool {
        self.name == LOCAL_TARGET
    }

    /// `user@host` (or just `host`).
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Captured result of a synchronous command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutput {
    /// Last non-empty line of stderr, falling back to stdout.
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let pick = |s: &str| {
            s.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Output and lifecycle events from an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stdout(String),
    Stderr(String),
    /// Session ended. `None` when killed, timed out, or signalled.
    Exit(Option<i32>),
}

/// Control surface for a live session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Write `input` to the session's stdin.
    async fn write(&self, input: &str) -> Result<(), ExecError>;

    /// Terminate the session. Idempotent.
    async fn kill(&self) -> Result<(), ExecError>;
}

/// A started session: its control handle plus its event stream.
///
/// The stream always ends with exactly one [`SessionEvent::Exit`].
pub struct SpawnedSession {
    pub control: Arc<dyn SessionControl>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Runs commands on named targets.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `target`, waiting at most `timeout`.
    async fn exec(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;

    /// Start a long-lived session on `target`, killed after `timeout`.
    async fn spawn_session(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<SpawnedSession, ExecError>;

    /// Connection info for `name`, if known.
    fn get_target(&self, name: &str) -> Option<TargetInfo>;

    /// Whether `name` uses Windows shell and path conventions.
    fn is_windows_target(&self, name: &str) -> bool {
        self.get_target(name)
            .is_some_and(|t| t.platform == Platform::Windows)
    }

    /// Platform of `name`, defaulting to Unix for unknown targets.
    fn platform(&self, name: &str) -> Platform {
        if self.is_windows_target(name) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_formats() {
        let mut t = TargetInfo::local();
        assert_eq!(t.destination(), "localhost");
        t.user = Some("itachi".into());
        assert_eq!(t.destination(), "itachi@localhost");
    }

    #[test]
    fn failure_summary_prefers_stderr() {
        let out = ExecOutput {
            success: false,
            stdout: "building\n".into(),
            stderr: "warning\nfatal: not a git repository\n\n".into(),
            exit_code: Some(128),
            timed_out: false,
        };
        assert_eq!(out.failure_summary(), "fatal: not a git repository");
    }

    #[test]
    fn failure_summary_falls_back_to_exit_code() {
        let out = ExecOutput {
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(out.failure_summary(), "exit code 2");

        let timed_out = ExecOutput {
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(timed_out.failure_summary(), "timed out");
    }
}
