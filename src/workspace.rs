//! Per-task workspaces: an isolated checkout on a dedicated branch.
//!
//! Layout, relative to the repos root on the target:
//! - `{project}` is the main checkout
//! - `{project}/../workspaces/{project}-{short_id}` is the task's workspace
//!
//! Tasks targeting a conventional default branch (`main`/`master`) get a
//! fresh `task/{short_id}` branch; any other branch is checked out as is.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::WorkspaceError;
use crate::exec::shell::{cd_and, join_path, quote, quote_path};
use crate::exec::{ExecOutput, Platform, RemoteExecutor};
use crate::tasks::Task;

/// `git ls-remote --exit-code` status when no ref matched.
const LS_REMOTE_NO_MATCH: i32 = 2;

/// A provisioned workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Path on the target machine.
    pub path: String,
    /// Branch the engine commits to.
    pub branch: String,
    /// Remote branch the work branch starts from.
    pub base_branch: String,
}

/// Whether `branch` is a conventional default branch.
pub fn is_default_branch(branch: &str) -> bool {
    matches!(branch, "main" | "master")
}

/// The other conventional default, tried once when `branch` is missing.
pub fn fallback_branch(branch: &str) -> Option<&'static str> {
    match branch {
        "main" => Some("master"),
        "master" => Some("main"),
        _ => None,
    }
}

/// Branch the task's work lands on.
pub fn work_branch(task: &Task) -> String {
    if is_default_branch(&task.branch) {
        format!("task/{}", task.short_id())
    } else {
        task.branch.clone()
    }
}

/// Creates task workspaces on execution targets.
pub struct WorkspaceProvisioner {
    executor: Arc<dyn RemoteExecutor>,
    repos_root: String,
    step_timeout: Duration,
}

impl WorkspaceProvisioner {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        repos_root: impl Into<String>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            repos_root: repos_root.into(),
            step_timeout,
        }
    }

    /// Main checkout of the task's project.
    pub fn project_dir(&self, platform: Platform, task: &Task) -> String {
        join_path(platform, &self.repos_root, &[&task.project])
    }

    /// Deterministic workspace path for `task`.
    pub fn workspace_path(&self, platform: Platform, task: &Task) -> String {
        let leaf = format!("{}-{}", task.project, task.short_id());
        join_path(
            platform,
            &self.repos_root,
            &[&task.project, "..", "workspaces", &leaf],
        )
    }

    /// Find the remote branch to base the work on.
    ///
    /// A missing `main` falls back to `master` and vice versa, once.
    /// Explicit branches are never substituted.
    pub async fn resolve_base_branch(
        &self,
        target: &str,
        task: &Task,
    ) -> Result<String, WorkspaceError> {
        let requested = task.branch.as_str();
        if self.remote_branch_exists(target, task, requested).await? {
            return Ok(requested.to_string());
        }

        let Some(fallback) = fallback_branch(requested) else {
            return Err(WorkspaceError::ExplicitBranchMissing(requested.to_string()));
        };

        if self.remote_branch_exists(target, task, fallback).await? {
            info!(
                task_id = %task.id,
                requested,
                fallback,
                "Requested branch missing on remote, using fallback"
            );
            return Ok(fallback.to_string());
        }

        Err(WorkspaceError::BranchMissing {
            branch: requested.to_string(),
            fallback: fallback.to_string(),
        })
    }

    /// Create the task's workspace on `target`.
    ///
    /// Clones `repo_url` when the task has one, otherwise adds a git
    /// worktree from the project's main checkout.
    pub async fn provision(&self, target: &str, task: &Task) -> Result<Workspace, WorkspaceError> {
        let platform = self.executor.platform(target);
        let base_branch = self.resolve_base_branch(target, task).await?;
        let branch = work_branch(task);
        let path = self.workspace_path(platform, task);

        match &task.repo_url {
            Some(url) => {
                let clone = format!(
                    "git clone --branch {} {} {}",
                    quote(&base_branch, platform),
                    quote(url, platform),
                    quote_path(&path, platform),
                );
                self.run_step(target, "clone", &clone).await?;

                let checkout = cd_and(
                    platform,
                    &path,
                    &format!("git checkout -B {}", quote(&branch, platform)),
                );
                self.run_step(target, "checkout", &checkout).await?;
            }
            None => {
                let project_dir = self.project_dir(platform, task);
                let fetch = cd_and(
                    platform,
                    &project_dir,
                    &format!(
                        "git worktree prune && git fetch origin {}",
                        quote(&base_branch, platform)
                    ),
                );
                self.run_step(target, "fetch", &fetch).await?;

                let add = cd_and(
                    platform,
                    &project_dir,
                    &format!(
                        "git worktree add -B {} {} {}",
                        quote(&branch, platform),
                        quote_path(&path, platform),
                        quote(&format!("origin/{base_branch}"), platform),
                    ),
                );
                self.run_step(target, "worktree", &add).await?;
            }
        }

        info!(task_id = %task.id, %path, %branch, base = %base_branch, "Workspace ready");
        Ok(Workspace {
            path,
            branch,
            base_branch,
        })
    }

    async fn remote_branch_exists(
        &self,
        target: &str,
        task: &Task,
        branch: &str,
    ) -> Result<bool, WorkspaceError> {
        let platform = self.executor.platform(target);
        let probe = match &task.repo_url {
            Some(url) => format!(
                "git ls-remote --exit-code --heads {} {}",
                quote(url, platform),
                quote(branch, platform)
            ),
            None => cd_and(
                platform,
                &self.project_dir(platform, task),
                &format!(
                    "git ls-remote --exit-code --heads origin {}",
                    quote(branch, platform)
                ),
            ),
        };

        let output = self.exec_step(target, "probe", &probe).await?;
        debug!(task_id = %task.id, branch, exit_code = ?output.exit_code, "Probed remote branch");
        match output {
            out if out.success => Ok(true),
            out if out.exit_code == Some(LS_REMOTE_NO_MATCH) => Ok(false),
            out => Err(WorkspaceError::StepFailed {
                step: "probe".into(),
                detail: out.failure_summary(),
            }),
        }
    }

    async fn exec_step(
        &self,
        target: &str,
        step: &str,
        command: &str,
    ) -> Result<ExecOutput, WorkspaceError> {
        let output = self
            .executor
            .exec(target, command, self.step_timeout)
            .await?;
        if output.timed_out {
            return Err(WorkspaceError::StepTimedOut {
                step: step.to_string(),
                timeout: self.step_timeout,
            });
        }
        Ok(output)
    }

    async fn run_step(&self, target: &str, step: &str, command: &str) -> Result<(), WorkspaceError> {
        let output = self.exec_step(target, step, command).await?;
        if !output.success {
            return Err(WorkspaceError::StepFailed {
                step: step.to_string(),
                detail: output.failure_summary(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::ExecError;
    use crate::exec::{SpawnedSession, TargetInfo};
    use crate::tasks::NewTask;

    type Responder = Box<dyn Fn(&str) -> ExecOutput + Send + Sync>;

    /// Records commands and answers them with a scripted responder.
    struct ScriptedExecutor {
        platform: Platform,
        commands: Mutex<Vec<String>>,
        respond: Responder,
    }

    impl ScriptedExecutor {
        fn new(respond: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                platform: Platform::Unix,
                commands: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn probes(&self) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.contains("ls-remote"))
                .count()
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn exec(
            &self,
            _target: &str,
            command: &str,
            _timeout: Duration,
        ) -> Result<ExecOutput, ExecError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok((self.respond)(command))
        }

        async fn spawn_session(
            &self,
            target: &str,
            _command: &str,
            _timeout: Duration,
        ) -> Result<SpawnedSession, ExecError> {
            Err(ExecError::SessionClosed {
                target: target.to_string(),
            })
        }

        fn get_target(&self, name: &str) -> Option<TargetInfo> {
            Some(TargetInfo {
                name: name.to_string(),
                host: "host".into(),
                user: None,
                port: None,
                platform: self.platform,
            })
        }
    }

    fn ok() -> ExecOutput {
        ExecOutput {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        }
    }

    fn no_match() -> ExecOutput {
        ExecOutput {
            exit_code: Some(LS_REMOTE_NO_MATCH),
            ..Default::default()
        }
    }

    /// Remote has exactly the listed branches; every other step succeeds.
    fn remote_with(branches: &'static [&'static str]) -> impl Fn(&str) -> ExecOutput {
        move |cmd: &str| {
            if cmd.contains("ls-remote") {
                if branches.iter().any(|b| cmd.ends_with(&format!(" {b}"))) {
                    ok()
                } else {
                    no_match()
                }
            } else {
                ok()
            }
        }
    }

    fn task(branch: &str) -> Task {
        let mut task = NewTask::new("itachi-memory", "do it")
            .with_branch(branch)
            .into_task();
        task.id = Uuid::parse_str("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa").unwrap();
        task
    }

    fn provisioner(exec: Arc<ScriptedExecutor>) -> WorkspaceProvisioner {
        WorkspaceProvisioner::new(exec, "~/itachi", Duration::from_secs(30))
    }

    #[test]
    fn workspace_path_is_sibling_of_project() {
        let p = provisioner(ScriptedExecutor::new(|_| ok()));
        let path = p.workspace_path(Platform::Unix, &task("main"));
        assert_eq!(path, "~/itachi/itachi-memory/../workspaces/itachi-memory-aaaaaaaa");
        assert!(path.ends_with("/workspaces/itachi-memory-aaaaaaaa"));

        let win = WorkspaceProvisioner::new(
            ScriptedExecutor::new(|_| ok()),
            r"C:\itachi",
            Duration::from_secs(30),
        );
        assert_eq!(
            win.workspace_path(Platform::Windows, &task("main")),
            r"C:\itachi\itachi-memory\..\workspaces\itachi-memory-aaaaaaaa"
        );
    }

    #[test]
    fn work_branch_per_target_branch() {
        assert_eq!(work_branch(&task("main")), "task/aaaaaaaa");
        assert_eq!(work_branch(&task("master")), "task/aaaaaaaa");
        assert_eq!(work_branch(&task("feature/login")), "feature/login");
    }

    #[test]
    fn fallback_pairs() {
        assert_eq!(fallback_branch("main"), Some("master"));
        assert_eq!(fallback_branch("master"), Some("main"));
        assert_eq!(fallback_branch("develop"), None);
    }

    #[tokio::test]
    async fn existing_branch_needs_one_probe() {
        let exec = ScriptedExecutor::new(remote_with(&["main"]));
        let base = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("main"))
            .await
            .unwrap();
        assert_eq!(base, "main");
        assert_eq!(exec.probes(), 1);
    }

    #[tokio::test]
    async fn missing_main_falls_back_to_master() {
        let exec = ScriptedExecutor::new(remote_with(&["master"]));
        let base = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("main"))
            .await
            .unwrap();
        assert_eq!(base, "master");
        assert_eq!(exec.probes(), 2);
    }

    #[tokio::test]
    async fn missing_master_falls_back_to_main() {
        let exec = ScriptedExecutor::new(remote_with(&["main"]));
        let base = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("master"))
            .await
            .unwrap();
        assert_eq!(base, "main");
    }

    #[tokio::test]
    async fn fallback_is_attempted_once() {
        let exec = ScriptedExecutor::new(remote_with(&["develop"]));
        let err = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("main"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::BranchMissing { ref branch, ref fallback }
                if branch == "main" && fallback == "master"
        ));
        assert_eq!(exec.probes(), 2);
    }

    #[tokio::test]
    async fn explicit_branch_is_never_substituted() {
        let exec = ScriptedExecutor::new(remote_with(&["main", "master"]));
        let err = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("feature/login"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::ExplicitBranchMissing(ref b) if b == "feature/login"));
        assert_eq!(exec.probes(), 1);
    }

    #[tokio::test]
    async fn probe_transport_failure_is_not_a_missing_branch() {
        let exec = ScriptedExecutor::new(|_| ExecOutput {
            stderr: "fatal: could not read from remote repository".into(),
            exit_code: Some(128),
            ..Default::default()
        });
        let err = provisioner(exec.clone())
            .resolve_base_branch("mac", &task("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::StepFailed { ref step, .. } if step == "probe"));
        assert_eq!(exec.probes(), 1);
    }

    #[tokio::test]
    async fn provision_adds_worktree_from_fallback_base() {
        let exec = ScriptedExecutor::new(remote_with(&["master"]));
        let ws = provisioner(exec.clone())
            .provision("mac", &task("main"))
            .await
            .unwrap();

        assert_eq!(ws.branch, "task/aaaaaaaa");
        assert_eq!(ws.base_branch, "master");
        assert!(ws.path.ends_with("workspaces/itachi-memory-aaaaaaaa"));

        let commands = exec.commands();
        let add = commands.last().unwrap();
        assert!(add.starts_with("cd ~/itachi/itachi-memory && "));
        assert!(add.contains("git worktree add -B task/aaaaaaaa"));
        assert!(add.ends_with("origin/master"));
        assert!(commands.iter().any(|c| c.contains("git fetch origin master")));
    }

    #[tokio::test]
    async fn provision_clones_when_repo_url_given() {
        let exec = ScriptedExecutor::new(remote_with(&["main"]));
        let mut t = task("main");
        t.repo_url = Some("git@github.com:x/itachi-memory.git".into());

        provisioner(exec.clone()).provision("mac", &t).await.unwrap();

        let commands = exec.commands();
        assert!(commands[0].starts_with("git ls-remote --exit-code --heads git@github.com:x/itachi-memory.git"));
        assert!(commands[1].starts_with("git clone --branch main git@github.com:x/itachi-memory.git ~/"));
        assert!(commands[2].ends_with("git checkout -B task/aaaaaaaa"));
        assert!(!commands.iter().any(|c| c.contains("worktree")));
    }

    #[tokio::test]
    async fn failed_step_reports_stderr() {
        let exec = ScriptedExecutor::new(|cmd: &str| {
            if cmd.contains("worktree add") {
                ExecOutput {
                    stderr: "fatal: 'ws' already exists\n".into(),
                    exit_code: Some(128),
                    ..Default::default()
                }
            } else {
                ok()
            }
        });
        let err = provisioner(exec)
            .provision("mac", &task("main"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Workspace step 'worktree' failed: fatal: 'ws' already exists"
        );
    }

    #[tokio::test]
    async fn timed_out_step() {
        let exec = ScriptedExecutor::new(|cmd: &str| {
            if cmd.contains("fetch") {
                ExecOutput {
                    timed_out: true,
                    ..Default::default()
                }
            } else {
                ok()
            }
        });
        let err = provisioner(exec)
            .provision("mac", &task("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::StepTimedOut { ref step, .. } if step == "fetch"));
    }
}
