use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use itachi_orchestrator::channels::{LogNotifier, Notifier, NotifySink, TelegramNotifier};
use itachi_orchestrator::config::{OrchestratorConfig, TelegramConfig, targets_from_env};
use itachi_orchestrator::error::RegistryError;
use itachi_orchestrator::exec::SshExecutor;
use itachi_orchestrator::machines::Machine;
use itachi_orchestrator::store::{LibSqlBackend, MachineRegistry};
use itachi_orchestrator::worker::{
    ConcurrencyGovernor, Orchestrator, OrchestratorDeps, RecoverySweep, spawn_claim_loop,
    spawn_recovery_loop,
};

/// How long running tasks get to finish after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("ITACHI_DB_PATH").unwrap_or_else(|_| "./data/itachi.db".to_string());
    let db = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    register_machine(&db, &config).await?;

    // ── Execution and notifications ──────────────────────────────────────
    let targets = targets_from_env().context("invalid ITACHI_TARGETS")?;
    let executor = SshExecutor::new(targets);
    info!(targets = ?executor.target_names(), "Execution targets loaded");

    let notifier: Arc<dyn Notifier> = match TelegramConfig::from_env()? {
        Some(telegram) => Arc::new(TelegramNotifier::new(&telegram)),
        None => {
            info!("Telegram not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    // ── Loops ────────────────────────────────────────────────────────────
    let governor = ConcurrencyGovernor::new();
    let deps = OrchestratorDeps {
        store: db.clone(),
        registry: db.clone(),
        executor: Arc::new(executor),
        notifier: Arc::clone(&notifier),
    };
    let orchestrator =
        Arc::new(Orchestrator::new(config.clone(), deps).with_governor(governor.clone()));
    let sweep = Arc::new(RecoverySweep::new(
        db.clone(),
        governor.clone(),
        NotifySink::new(notifier),
        config.orchestrator_id.clone(),
        config.recovery.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let claim_loop = spawn_claim_loop(orchestrator, shutdown_rx.clone());
    let recovery_loop = spawn_recovery_loop(sweep, shutdown_rx);

    eprintln!("Itachi orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Orchestrator: {}", config.orchestrator_id);
    eprintln!("   Machine: {} (cap {})", config.machine_id, config.max_concurrent);
    eprintln!("   Database: {db_path}");
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let (claim, recovery) = tokio::join!(claim_loop, recovery_loop);
    if let Err(e) = claim.and(recovery) {
        warn!(error = %e, "Background loop ended abnormally");
    }

    wait_for_running_tasks(&governor, SHUTDOWN_GRACE).await;
    Ok(())
}

/// stderr logging, plus a daily log file when `ITACHI_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false);

    match std::env::var("ITACHI_LOG_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
    {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "itachi-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// Make sure this orchestrator's machine exists in the registry.
async fn register_machine(db: &LibSqlBackend, config: &OrchestratorConfig) -> anyhow::Result<()> {
    match db.resolve_machine(&config.machine_id).await {
        Ok(machine) => {
            info!(
                machine_id = %machine.id,
                max_concurrent = machine.max_concurrent,
                engines = ?machine.engine_priority,
                "Machine registered"
            );
        }
        Err(RegistryError::NotFound(_)) => {
            let machine = Machine::new(&config.machine_id, config.max_concurrent);
            db.upsert_machine(&machine)
                .await
                .context("failed to register machine")?;
            info!(machine_id = %machine.id, "Registered new machine");
        }
        Err(e) => return Err(e).context("machine registry unavailable"),
    }
    Ok(())
}

async fn wait_for_running_tasks(governor: &ConcurrencyGovernor, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let active = governor.active_count();
        if active == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(active, "Exiting with tasks still running; recovery will fail them");
            return;
        }
        info!(active, "Waiting for running tasks");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
