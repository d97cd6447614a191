//! Configuration types.
//!
//! Everything is read from the environment with parse-with-fallback
//! defaults, then checked by [`OrchestratorConfig::validate`].

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::exec::{Platform, TargetInfo};

/// Orchestrator (claim loop + runner) configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity recorded on every claimed task.
    pub orchestrator_id: String,
    /// Machine this orchestrator claims for.
    pub machine_id: String,
    /// Delay between claim loop ticks.
    pub poll_interval: Duration,
    /// Concurrency cap when the registry cannot resolve `machine_id`.
    pub max_concurrent: usize,
    /// Directory holding one checkout per project on every target.
    pub repos_root: String,
    /// Upper bound on a single engine run.
    pub task_timeout: Duration,
    /// Timeout for provisioning and bookkeeping commands.
    pub exec_timeout: Duration,
    /// Run engines as interactive streaming sessions instead of sync exec.
    pub streaming: bool,
    /// Attempts for terminal status updates.
    pub update_attempts: u32,
    /// First retry delay for terminal status updates; doubles per attempt.
    pub update_backoff: Duration,
    /// Machine heartbeat age that marks a machine offline.
    pub machine_liveness: Duration,
    /// Interval between streamed-output flushes to the notification thread.
    pub stream_flush_interval: Duration,
    pub recovery: RecoveryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: default_orchestrator_id(),
            machine_id: "local".to_string(),
            poll_interval: Duration::from_secs(10),
            max_concurrent: 2,
            repos_root: "~/itachi".to_string(),
            task_timeout: Duration::from_secs(3600), // 1 hour
            exec_timeout: Duration::from_secs(120),
            streaming: true,
            update_attempts: 3,
            update_backoff: Duration::from_millis(500),
            machine_liveness: crate::machines::LIVENESS_THRESHOLD,
            stream_flush_interval: Duration::from_secs(5),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build from `ITACHI_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            orchestrator_id: std::env::var("ITACHI_ORCHESTRATOR_ID")
                .unwrap_or(defaults.orchestrator_id),
            machine_id: std::env::var("ITACHI_MACHINE_ID").unwrap_or(defaults.machine_id),
            poll_interval: env_secs("ITACHI_POLL_INTERVAL_SECS", defaults.poll_interval),
            max_concurrent: env_parse("ITACHI_MAX_CONCURRENT", defaults.max_concurrent),
            repos_root: std::env::var("ITACHI_REPOS_ROOT").unwrap_or(defaults.repos_root),
            task_timeout: env_secs("ITACHI_TASK_TIMEOUT_SECS", defaults.task_timeout),
            exec_timeout: env_secs("ITACHI_EXEC_TIMEOUT_SECS", defaults.exec_timeout),
            streaming: env_bool("ITACHI_STREAMING", defaults.streaming),
            update_attempts: env_parse("ITACHI_UPDATE_ATTEMPTS", defaults.update_attempts),
            update_backoff: defaults.update_backoff,
            machine_liveness: defaults.machine_liveness,
            stream_flush_interval: env_secs(
                "ITACHI_STREAM_FLUSH_SECS",
                defaults.stream_flush_interval,
            ),
            recovery: RecoveryConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator_id.trim().is_empty() {
            return Err(invalid("ITACHI_ORCHESTRATOR_ID", "must not be empty"));
        }
        if self.machine_id.trim().is_empty() {
            return Err(invalid("ITACHI_MACHINE_ID", "must not be empty"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("ITACHI_MAX_CONCURRENT", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("ITACHI_POLL_INTERVAL_SECS", "must be positive"));
        }
        if self.update_attempts == 0 {
            return Err(invalid("ITACHI_UPDATE_ATTEMPTS", "must be at least 1"));
        }
        self.recovery.validate()?;
        if self.recovery.heartbeat_ttl <= self.poll_interval {
            return Err(invalid(
                "ITACHI_HEARTBEAT_TTL_SECS",
                "must be longer than the poll interval",
            ));
        }
        Ok(())
    }
}

/// Stale recovery sweep configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// Held tasks older than this with no local executor are failed.
    pub stale_after: Duration,
    /// Unassigned queued tasks older than this are reported.
    pub starvation_after: Duration,
    /// An orchestrator silent for longer than this is presumed gone.
    pub heartbeat_ttl: Duration,
    /// Thread that receives starvation alerts.
    pub alert_thread_id: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),       // 10 minutes
            starvation_after: Duration::from_secs(1800), // 30 minutes
            heartbeat_ttl: Duration::from_secs(60),
            alert_thread_id: None,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_secs("ITACHI_RECOVERY_INTERVAL_SECS", defaults.interval),
            stale_after: env_secs("ITACHI_STALE_AFTER_SECS", defaults.stale_after),
            starvation_after: env_secs("ITACHI_STARVATION_AFTER_SECS", defaults.starvation_after),
            heartbeat_ttl: env_secs("ITACHI_HEARTBEAT_TTL_SECS", defaults.heartbeat_ttl),
            alert_thread_id: std::env::var("ITACHI_ALERT_THREAD_ID")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(invalid("ITACHI_RECOVERY_INTERVAL_SECS", "must be positive"));
        }
        if self.stale_after.is_zero() {
            return Err(invalid("ITACHI_STALE_AFTER_SECS", "must be positive"));
        }
        Ok(())
    }
}

/// Telegram notification settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Forum-enabled group that hosts one topic per task.
    pub chat_id: String,
}

impl TelegramConfig {
    /// `None` when `TELEGRAM_BOT_TOKEN` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") else {
            return Ok(None);
        };
        let chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_CHAT_ID".to_string()))?;
        Ok(Some(Self {
            bot_token: SecretString::from(token),
            chat_id,
        }))
    }
}

/// Parse execution targets from `ITACHI_TARGETS`.
///
/// Format: comma-separated `name=user@host[:port][/windows]`.
/// The `local` target is always present.
pub fn targets_from_env() -> Result<Vec<TargetInfo>, ConfigError> {
    let raw = std::env::var("ITACHI_TARGETS").unwrap_or_default();
    parse_targets(&raw)
}

pub fn parse_targets(raw: &str) -> Result<Vec<TargetInfo>, ConfigError> {
    let mut targets = vec![TargetInfo::local()];

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, addr) = entry
            .split_once('=')
            .ok_or_else(|| invalid("ITACHI_TARGETS", &format!("missing '=' in '{entry}'")))?;

        let (addr, platform) = match addr.strip_suffix("/windows") {
            Some(rest) => (rest, Platform::Windows),
            None => (addr, Platform::Unix),
        };

        let (user, host_port) = addr
            .split_once('@')
            .ok_or_else(|| invalid("ITACHI_TARGETS", &format!("missing user in '{entry}'")))?;

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    invalid("ITACHI_TARGETS", &format!("bad port '{port}' in '{entry}'"))
                })?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if name.trim().is_empty() || user.is_empty() || host.is_empty() {
            return Err(invalid("ITACHI_TARGETS", &format!("incomplete entry '{entry}'")));
        }

        let target = TargetInfo {
            name: name.trim().to_string(),
            host: host.to_string(),
            user: Some(user.to_string()),
            port,
            platform,
        };
        targets.retain(|t| t.name != target.name);
        targets.push(target);
    }

    Ok(targets)
}

fn default_orchestrator_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref().map(str::trim) {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
