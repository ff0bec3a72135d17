//! The adapter facade: `spawn`, `get_status`, `stop`.
//!
//! [`ClaudeAdapter`] composes the worktree manager, process supervisor,
//! and instance registry under the [`AgentAdapter`] contract consumed by
//! the orchestration framework. All cross-component sequencing happens
//! here, under the registry's per-instance lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::AdapterConfig;
use crate::context::SpawnContext;
use crate::error::{AdapterError, RegistryError, TeardownError, WorktreeError};
use crate::instance::{AgentInstance, InstanceState};
use crate::registry::InstanceRegistry;
use crate::supervisor::{
    LaunchSpec, OutputSnapshot, PollStatus, ProcessHandle, ProcessSupervisor,
};
use crate::worktree::WorktreeManager;

/// Returned by a successful `spawn`.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnReceipt {
    pub instance_id: Uuid,
    pub role: String,
    pub task_ref: String,
    pub model: String,
    pub worktree: PathBuf,
    pub branch: String,
    pub spawned_at: DateTime<Utc>,
}

/// Returned by `get_status` and `stop`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub role: String,
    pub task_ref: String,
    pub state: InstanceState,
    pub exit_code: Option<i32>,
    pub worktree: PathBuf,
    pub branch: String,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    fn from_instance(instance: &AgentInstance) -> Self {
        Self {
            instance_id: instance.id,
            role: instance.role.clone(),
            task_ref: instance.task_ref.clone(),
            state: instance.state,
            exit_code: instance.exit_code,
            worktree: instance.worktree.clone(),
            branch: instance.branch.clone(),
            last_activity: instance.last_activity,
            ended_at: instance.ended_at,
        }
    }
}

/// Contract consumed by the orchestration framework.
///
/// Object-safe so callers can hold `Box<dyn AgentAdapter>` next to
/// adapters for other agent CLIs.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Human-readable adapter name, e.g. "claude-code".
    fn name(&self) -> &str;

    /// Create an isolated worktree, launch the agent inside it, and
    /// register the instance. Rolls the worktree back on any failure.
    async fn spawn(
        &self,
        role: &str,
        task_ref: &str,
        context: &SpawnContext,
        model: Option<&str>,
    ) -> Result<SpawnReceipt, AdapterError>;

    /// Report an instance's state, reconciling liveness with the
    /// supervisor before answering.
    async fn get_status(&self, instance_id: Uuid) -> Result<StatusReport, AdapterError>;

    /// Terminate the process, destroy the worktree, and mark the
    /// instance `stopped`. Every sub-step is attempted even when an
    /// earlier one fails. Idempotent on a stopped instance.
    async fn stop(&self, instance_id: Uuid) -> Result<StatusReport, AdapterError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentAdapter) {}
};

/// Adapter for the Claude Code CLI.
#[derive(Debug)]
pub struct ClaudeAdapter {
    config: AdapterConfig,
    worktrees: WorktreeManager,
    supervisor: ProcessSupervisor,
    registry: InstanceRegistry,
}

impl ClaudeAdapter {
    /// Build an adapter from a config, validating the repository root.
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let worktrees = WorktreeManager::new(
            &config.repo_root,
            &config.worktree_root,
            &config.branch_prefix,
        )?;
        let supervisor =
            ProcessSupervisor::new(&config.claude_binary, config.output_buffer_lines);

        Ok(Self {
            config,
            worktrees,
            supervisor,
            registry: InstanceRegistry::new(),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// The registry backing this adapter, for listing and inspection.
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Snapshot the captured output of an instance's process.
    pub async fn capture_output(&self, instance_id: Uuid) -> Result<OutputSnapshot, AdapterError> {
        let instance = self.registry.get(instance_id).await?;
        match instance.pid {
            Some(pid) => Ok(self.supervisor.output(ProcessHandle { pid, instance_id })),
            None => Ok(OutputSnapshot::default()),
        }
    }

    /// Run a worktree operation off the async threads.
    async fn run_git<T, F>(&self, op: F) -> Result<T, WorktreeError>
    where
        T: Send + 'static,
        F: FnOnce(WorktreeManager) -> Result<T, WorktreeError> + Send + 'static,
    {
        let mgr = self.worktrees.clone();
        tokio::task::spawn_blocking(move || op(mgr))
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "worktree task failed to run".into(),
                source: std::io::Error::other(e),
            })?
    }

    /// Best-effort rollback of a worktree created during a failed spawn.
    async fn rollback_worktree(&self, instance_id: Uuid, path: PathBuf, branch: String) {
        let result = self
            .run_git(move |mgr| mgr.destroy(&path, &branch))
            .await;
        if let Err(e) = result {
            tracing::warn!(
                instance_id = %instance_id,
                error = %e,
                "failed to roll back worktree after spawn failure"
            );
        }
    }

    /// Reconcile a running instance against the supervisor.
    ///
    /// Caller must hold the per-instance lock.
    async fn reconcile(&self, instance: &mut AgentInstance) -> Result<(), RegistryError> {
        if instance.state != InstanceState::Running {
            return Ok(());
        }
        let Some(pid) = instance.pid else {
            return Ok(());
        };

        let handle = ProcessHandle {
            pid,
            instance_id: instance.id,
        };
        match self.supervisor.poll(handle).await {
            PollStatus::Running => {
                instance.touch();
            }
            PollStatus::Exited { code } => {
                instance.exit_code = Some(code);
                let next = if code == 0 {
                    InstanceState::Completed
                } else {
                    InstanceState::Failed
                };
                tracing::info!(
                    instance_id = %instance.id,
                    code,
                    state = %next,
                    "agent process exited"
                );
                instance.transition(next)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn spawn(
        &self,
        role: &str,
        task_ref: &str,
        context: &SpawnContext,
        model: Option<&str>,
    ) -> Result<SpawnReceipt, AdapterError> {
        let instance_id = Uuid::new_v4();
        let model = model.unwrap_or(&self.config.default_model).to_string();
        let branch = self.worktrees.branch_name(role, task_ref, instance_id);
        let worktree = self.worktrees.worktree_path(role, task_ref, instance_id);

        tracing::info!(
            instance_id = %instance_id,
            role,
            task_ref,
            branch = %branch,
            "spawning agent instance"
        );

        self.registry.register(AgentInstance::new(
            instance_id,
            role,
            task_ref,
            &model,
            worktree.clone(),
            &branch,
        ))?;
        let mut guard = self.registry.lock(instance_id).await?;

        // 1. Isolated worktree.
        let create_result = {
            let branch = branch.clone();
            let worktree = worktree.clone();
            self.run_git(move |mgr| mgr.create(&branch, &worktree)).await
        };
        if let Err(e) = create_result {
            let _ = guard.transition(InstanceState::Failed);
            drop(guard);
            let _ = self.registry.remove(instance_id).await;
            return Err(e.into());
        }

        // 2. Agent process bound to it.
        let spec = LaunchSpec {
            instance_id,
            role: role.to_string(),
            task_ref: task_ref.to_string(),
            branch: branch.clone(),
            model: model.clone(),
            worktree: worktree.clone(),
            context: context.clone(),
        };
        let handle = match self.supervisor.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = guard.transition(InstanceState::Failed);
                drop(guard);
                // No orphaned worktrees on a failed spawn.
                self.rollback_worktree(instance_id, worktree, branch).await;
                let _ = self.registry.remove(instance_id).await;
                return Err(e.into());
            }
        };

        // 3. Record the triple; running only on confirmed start.
        guard.pid = Some(handle.pid);
        guard.transition(InstanceState::Running)?;

        Ok(SpawnReceipt {
            instance_id,
            role: guard.role.clone(),
            task_ref: guard.task_ref.clone(),
            model,
            worktree: guard.worktree.clone(),
            branch: guard.branch.clone(),
            spawned_at: guard.created_at,
        })
    }

    async fn get_status(&self, instance_id: Uuid) -> Result<StatusReport, AdapterError> {
        let mut guard = self.registry.lock(instance_id).await?;
        self.reconcile(&mut guard).await?;
        Ok(StatusReport::from_instance(&guard))
    }

    async fn stop(&self, instance_id: Uuid) -> Result<StatusReport, AdapterError> {
        let mut guard = self.registry.lock(instance_id).await?;

        // Stopping an already-stopped instance is a no-op, not an error.
        if guard.state == InstanceState::Stopped {
            return Ok(StatusReport::from_instance(&guard));
        }

        tracing::info!(instance_id = %instance_id, state = %guard.state, "stopping instance");
        let mut failures: Vec<String> = Vec::new();

        // 1. Terminate the process.
        if let Some(pid) = guard.pid {
            let handle = ProcessHandle { pid, instance_id };
            if let Err(e) = self
                .supervisor
                .terminate(handle, self.config.grace_timeout())
                .await
            {
                failures.push(format!("terminate failed: {e:#}"));
            }
            if guard.exit_code.is_none() {
                if let PollStatus::Exited { code } = self.supervisor.poll(handle).await {
                    guard.exit_code = Some(code);
                }
            }
            self.supervisor.release(handle);
        }

        // 2. Destroy the worktree and its branch, even if the kill failed.
        {
            let path = guard.worktree.clone();
            let branch = guard.branch.clone();
            if let Err(e) = self.run_git(move |mgr| mgr.destroy(&path, &branch)).await {
                failures.push(format!("worktree destroy failed: {e}"));
            }
        }

        // 3. Mark stopped regardless of earlier faults.
        if let Err(e) = guard.transition(InstanceState::Stopped) {
            failures.push(format!("state transition failed: {e}"));
        }

        let report = StatusReport::from_instance(&guard);
        drop(guard);

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(TeardownError {
                instance_id,
                failures,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_a_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AdapterConfig::new(tmp.path(), tmp.path().join("worktrees"));
        let err = ClaudeAdapter::new(config).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Worktree(WorktreeError::NotAGitRepo(_))
        ));
    }

    #[tokio::test]
    async fn adapter_is_usable_as_a_trait_object() {
        let (_dir, repo_path) = herd_test_utils::create_temp_repo();
        let tmp = tempfile::tempdir().unwrap();
        let config = AdapterConfig::new(&repo_path, tmp.path());
        let adapter: Box<dyn AgentAdapter> = Box::new(ClaudeAdapter::new(config).unwrap());
        assert_eq!(adapter.name(), "claude-code");

        let err = adapter.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Registry(RegistryError::NotFound(_))
        ));
    }
}
