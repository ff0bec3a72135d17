//! Agent instance records and their lifecycle state machine.
//!
//! An [`AgentInstance`] is the authoritative record for one spawned agent:
//! identity, worktree, process handle, and position in the lifecycle state
//! machine. Instances are owned exclusively by the
//! [`InstanceRegistry`](crate::registry::InstanceRegistry); other components
//! act on data passed by reference and hold no copies of their own.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;

/// Lifecycle state of an agent instance.
///
/// Valid transitions:
///
/// ```text
/// pending   -> running            (process start confirmed)
/// pending   -> failed             (creation or launch failed)
/// running   -> completed          (process exited 0)
/// running   -> failed             (process exited nonzero or crashed)
/// pending   -> stopped            (explicit teardown)
/// running   -> stopped
/// completed -> stopped
/// failed    -> stopped
/// ```
///
/// `stopped` is final; nothing leaves it. `completed` and `failed` are
/// terminal for the process but may still move to `stopped` when the
/// instance is explicitly torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Worktree being prepared, process not yet started.
    Pending,
    /// Process launched and confirmed alive.
    Running,
    /// Process exited with status 0.
    Completed,
    /// Process exited nonzero, crashed, or never started.
    Failed,
    /// Explicitly torn down; worktree reclaimed.
    Stopped,
}

impl InstanceState {
    /// Whether this state permits removal from the registry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Check whether `from -> to` is a valid edge in the state graph.
    pub fn is_valid_transition(from: InstanceState, to: InstanceState) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Stopped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Stopped)
                | (Self::Completed, Self::Stopped)
                | (Self::Failed, Self::Stopped)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Authoritative record for one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Opaque unique identifier, stable for the instance's lifetime.
    pub id: Uuid,
    /// Role tag, e.g. "grunt".
    pub role: String,
    /// External task reference, e.g. a ticket id like "DBC-123".
    pub task_ref: String,
    /// Model the agent was launched with.
    pub model: String,
    /// Filesystem path of the instance's worktree.
    pub worktree: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// OS pid of the agent process, once launched.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Exit code, once the process has exited.
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    /// Last time the adapter observed the instance (liveness poll,
    /// state change).
    pub last_activity: DateTime<Utc>,
    /// Set when the instance enters `completed`, `failed`, or `stopped`.
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    /// Create a new instance record in the `pending` state.
    pub fn new(
        id: Uuid,
        role: impl Into<String>,
        task_ref: impl Into<String>,
        model: impl Into<String>,
        worktree: PathBuf,
        branch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            role: role.into(),
            task_ref: task_ref.into(),
            model: model.into(),
            worktree,
            branch: branch.into(),
            pid: None,
            state: InstanceState::Pending,
            exit_code: None,
            created_at: now,
            last_activity: now,
            ended_at: None,
        }
    }

    /// Execute a state transition, enforcing the lifecycle graph.
    ///
    /// Updates `last_activity` and sets `ended_at` on entry into a
    /// terminal state. Returns [`RegistryError::InvalidTransition`] for
    /// transitions that are not edges of the graph.
    pub fn transition(&mut self, to: InstanceState) -> Result<(), RegistryError> {
        if !InstanceState::is_valid_transition(self.state, to) {
            return Err(RegistryError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        self.state = to;
        self.last_activity = now;
        if to.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }

        Ok(())
    }

    /// Record that the adapter observed the instance just now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
