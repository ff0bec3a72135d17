//! Herd execution adapter for the Claude Code CLI.
//!
//! Spawns agent instances as `claude` subprocesses, each isolated in its
//! own git worktree on a dedicated branch, and supervises them through a
//! small lifecycle state machine:
//!
//! ```text
//! pending -> running -> completed | failed
//!     \__________\___________\______/
//!                 v
//!              stopped
//! ```
//!
//! The public surface is the [`AgentAdapter`] trait and its
//! [`ClaudeAdapter`] implementation:
//!
//! ```no_run
//! use herd_agent_claude::{AdapterConfig, AgentAdapter, ClaudeAdapter, SpawnContext};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let adapter = ClaudeAdapter::new(AdapterConfig::new("/src/repo", "/tmp/worktrees"))?;
//!
//! let context = SpawnContext {
//!     role_definition: "You are Grunt, the backend developer.".into(),
//!     craft_standards: "Write tests.".into(),
//!     project_guidelines: "Use Rust 1.85+.".into(),
//!     assignment: "Implement feature X for DBC-123.".into(),
//!     environment: Default::default(),
//!     skills: vec![],
//! };
//!
//! let receipt = adapter.spawn("grunt", "DBC-123", &context, None).await?;
//! let status = adapter.get_status(receipt.instance_id).await?;
//! println!("{:?}", status.state);
//! adapter.stop(receipt.instance_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod registry;
pub mod supervisor;
pub mod worktree;

pub use adapter::{AgentAdapter, ClaudeAdapter, SpawnReceipt, StatusReport};
pub use config::AdapterConfig;
pub use context::SpawnContext;
pub use error::{AdapterError, LaunchError, RegistryError, TeardownError, WorktreeError};
pub use instance::{AgentInstance, InstanceState};
pub use registry::InstanceRegistry;
pub use supervisor::{
    OutputLine, OutputSnapshot, PollStatus, ProcessHandle, ProcessSupervisor,
};
pub use worktree::{WorktreeInfo, WorktreeManager};
