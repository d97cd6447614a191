//! SSH-backed [`RemoteExecutor`].
//!
//! Remote targets run through the system `ssh` client in batch mode; the
//! `local` target runs through the local shell. ssh exits with 255 when
//! the connection itself fails, which is reported as
//! [`ExecError::Unreachable`] rather than a command failure.
//!
//! On unix every command gets its own process group, and kills and
//! timeouts signal the whole group: `cd ws && engine …` leaves the engine
//! as a grandchild that would otherwise outlive its shell and hold the
//! output pipes open.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ExecOutput, RemoteExecutor, SessionControl, SessionEvent, SpawnedSession, TargetInfo};
use crate::error::ExecError;

/// ssh's exit status for connection-level failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Read buffer for streamed output.
const CHUNK_SIZE: usize = 4096;

/// How long output readers may run on after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Runs commands over ssh (or locally for the `local` target).
#[derive(Debug, Clone)]
pub struct SshExecutor {
    targets: HashMap<String, TargetInfo>,
    connect_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor for `targets`. The local target is always added.
    pub fn new(targets: Vec<TargetInfo>) -> Self {
        let mut map: HashMap<String, TargetInfo> = targets
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        map.entry(super::LOCAL_TARGET.to_string())
            .or_insert_with(TargetInfo::local);
        Self {
            targets: map,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the ssh connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// All configured target names.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(&self, name: &str) -> Result<&TargetInfo, ExecError> {
        self.targets
            .get(name)
            .ok_or_else(|| ExecError::UnknownTarget(name.to_string()))
    }

    /// Build the process that runs `command` on `target`.
    fn build_command(&self, target: &TargetInfo, command: &str) -> Command {
        if target.is_local() {
            let mut c = if cfg!(target_os = "windows") {
                let mut c = Command::new("cmd");
                c.args(["/C", command]);
                c
            } else {
                let mut c = Command::new("sh");
                c.args(["-c", command]);
                c
            };
            c.kill_on_drop(true);
            #[cfg(unix)]
            c.process_group(0);
            return c;
        }

        let mut c = Command::new("ssh");
        c.args(ssh_args(target, self.connect_timeout))
            .arg("--")
            .arg(command)
            .kill_on_drop(true);
        #[cfg(unix)]
        c.process_group(0);
        c
    }

    fn spawn_child(
        &self,
        target: &TargetInfo,
        command: &str,
        stdin: Stdio,
    ) -> Result<Child, ExecError> {
        self.build_command(target, command)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnFailed {
                target: target.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// ssh client arguments (everything before `--`).
fn ssh_args(target: &TargetInfo, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-T".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
    ];
    if let Some(port) = target.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args.push(target.destination());
    args
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let info = self.resolve(target)?;
        let mut child = self.spawn_child(info, command, Stdio::null())?;

        debug!(target = %info.name, timeout_secs = timeout.as_secs(), "exec");

        let stdout = child.stdout.take().map(spawn_collector);
        let stderr = child.stderr.take().map(spawn_collector);

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(target = %info.name, "Command timed out after {:?}", timeout);
                kill_tree(&mut child);
                let _ = tokio::time::timeout(READER_GRACE, child.wait()).await;
                for collector in [stdout, stderr].into_iter().flatten() {
                    collector.abort();
                }
                return Ok(ExecOutput {
                    success: false,
                    timed_out: true,
                    ..Default::default()
                });
            }
        };

        let output = std::process::Output {
            status,
            stdout: drain_collector(stdout).await,
            stderr: drain_collector(stderr).await,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !info.is_local() && exit_code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(ExecError::Unreachable {
                target: info.name.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(ExecOutput {
            success: output.status.success(),
            stdout,
            stderr,
            exit_code,
            timed_out: false,
        })
    }

    async fn spawn_session(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<SpawnedSession, ExecError> {
        let info = self.resolve(target)?;
        let mut child = self.spawn_child(info, command, Stdio::piped())?;

        let stdin = child.stdin.take();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::channel(16);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, event_tx.clone(), SessionEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, event_tx.clone(), SessionEvent::Stderr));
        }

        let target_name = info.name.clone();
        tokio::spawn(supervise(
            target_name.clone(),
            child,
            stdin,
            control_rx,
            event_tx,
            readers,
            timeout,
        ));

        Ok(SpawnedSession {
            control: Arc::new(SshSession {
                target: target_name,
                control_tx,
            }),
            events: event_rx,
        })
    }

    fn get_target(&self, name: &str) -> Option<TargetInfo> {
        self.targets.get(name).cloned()
    }
}

/// Commands sent from a [`SshSession`] handle to its supervisor.
enum SessionCommand {
    Write(String, oneshot::Sender<Result<(), ExecError>>),
    Kill(oneshot::Sender<()>),
}

/// Control handle for a running ssh/local session.
struct SshSession {
    target: String,
    control_tx: mpsc::Sender<SessionCommand>,
}

#[async_trait]
impl SessionControl for SshSession {
    async fn write(&self, input: &str) -> Result<(), ExecError> {
        let closed = || ExecError::SessionClosed {
            target: self.target.clone(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(SessionCommand::Write(input.to_string(), reply_tx))
            .await
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }

    async fn kill(&self) -> Result<(), ExecError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .control_tx
            .send(SessionCommand::Kill(reply_tx))
            .await
            .is_err()
        {
            // Already exited.
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }
}

/// Signal the child's whole process group, falling back to the child.
fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        if kill_group(pid) {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `kill` has no memory-safety preconditions. The group was
    // created for this child by `process_group(0)`.
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, "Failed to kill process group: {err}");
            return false;
        }
    }
    true
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

fn spawn_collector<R>(mut reader: R) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("Command output read error: {e}");
        }
        buf
    })
}

/// Collected output, or nothing if the pipe is still held open after
/// the grace period.
async fn drain_collector(collector: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut collector) = collector else {
        return Vec::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut collector).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            debug!("Command output still open after exit, dropping it");
            collector.abort();
            Vec::new()
        }
    }
}

fn spawn_reader<R>(
    mut reader: R,
    tx: mpsc::Sender<SessionEvent>,
    wrap: fn(String) -> SessionEvent,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(wrap(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Session output read error: {e}");
                    break;
                }
            }
        }
    })
}

/// Own the child until it exits: apply control commands, enforce the
/// timeout, then emit the single `Exit` event after all output.
async fn supervise(
    target: String,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut control_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut terminated = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(command) = control_rx.recv() => match command {
                SessionCommand::Write(input, reply) => {
                    let result = match stdin.as_mut() {
                        Some(pipe) => write_input(pipe, &input).await.map_err(ExecError::Io),
                        None => Err(ExecError::SessionClosed { target: target.clone() }),
                    };
                    let _ = reply.send(result);
                }
                SessionCommand::Kill(reply) => {
                    if !terminated {
                        debug!(target = %target, "Killing session");
                        kill_tree(&mut child);
                        terminated = true;
                    }
                    let _ = reply.send(());
                }
            },
            _ = &mut deadline, if !terminated => {
                warn!(target = %target, "Session timed out after {:?}", timeout);
                kill_tree(&mut child);
                terminated = true;
            }
        }
    };

    drop(stdin);
    let grace = tokio::time::Instant::now() + READER_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(grace, &mut reader).await.is_err() {
            debug!(target = %target, "Session output still open after exit, dropping it");
            reader.abort();
        }
    }

    let code = match status {
        Ok(status) if !terminated => status.code(),
        Ok(_) => None,
        Err(e) => {
            warn!(target = %target, "Failed to wait for session: {e}");
            None
        }
    };
    let _ = event_tx.send(SessionEvent::Exit(code)).await;
}

async fn write_input(pipe: &mut ChildStdin, input: &str) -> std::io::Result<()> {
    pipe.write_all(input.as_bytes()).await?;
    pipe.flush().await
}
