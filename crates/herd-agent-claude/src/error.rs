//! Error taxonomy for the adapter.
//!
//! Configuration-time failures (bad paths, branch collisions, missing
//! binaries) surface as typed errors from `spawn`. Runtime failures of a
//! running agent (process crash) are recorded as instance state and are
//! only observable through `get_status`, never thrown.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::instance::InstanceState;

/// Errors from git worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The repository root does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The branch for a new worktree already exists. Branch names embed
    /// the instance id, so a collision means misconfiguration rather
    /// than a retryable race.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to prepare the worktree base directory.
    #[error("failed to prepare worktree root {path}")]
    WorktreeRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    Parse(String),
}

/// Errors from launching the agent subprocess.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The worktree directory the agent should run in does not exist.
    #[error("working directory does not exist: {0}")]
    MissingWorkdir(PathBuf),

    /// Failed to write the bootstrap context files into the worktree.
    #[error("failed to write bootstrap files under {path}")]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The agent binary could not be spawned (missing, not executable).
    #[error("failed to spawn claude binary at '{binary}' -- is it installed and on PATH?")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The spawned process exited before a pid could be observed.
    #[error("spawned process has no pid")]
    NoPid,
}

/// Errors from the instance registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An instance with this id is already registered.
    #[error("duplicate instance id: {0}")]
    DuplicateInstance(Uuid),

    /// No instance with this id is registered.
    #[error("instance {0} not found")]
    NotFound(Uuid),

    /// The requested state transition is not an edge of the lifecycle
    /// state machine.
    #[error("invalid state transition: {from} -> {to} for instance {id}")]
    InvalidTransition {
        id: Uuid,
        from: InstanceState,
        to: InstanceState,
    },

    /// `remove` was called before the instance reached a terminal state.
    #[error("instance {id} is still {state}; removal requires a terminal state")]
    NotTerminal { id: Uuid, state: InstanceState },
}

/// Aggregate of partial teardown failures.
///
/// `stop` attempts every sub-step (terminate, worktree removal, branch
/// deletion) even when an earlier one fails, and reports everything that
/// went wrong rather than masking later faults with the first one.
#[derive(Debug, Error)]
#[error("teardown of instance {instance_id} completed with {} failure(s): {}", .failures.len(), .failures.join("; "))]
pub struct TeardownError {
    pub instance_id: Uuid,
    pub failures: Vec<String>,
}

/// Top-level adapter error.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),
}
