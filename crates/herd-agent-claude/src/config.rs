//! Adapter configuration.
//!
//! The three required inputs come from the orchestrator at construction:
//! repository root, worktree root, and branch prefix. The rest have
//! defaults and can be overridden from a TOML fragment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_branch_prefix() -> String {
    "herd".to_string()
}

fn default_claude_binary() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_grace_timeout_secs() -> u64 {
    5
}

fn default_output_buffer_lines() -> usize {
    2000
}

/// Configuration for [`ClaudeAdapter`](crate::adapter::ClaudeAdapter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Path to the shared git repository agents branch from.
    pub repo_root: PathBuf,
    /// Directory under which per-instance worktrees are created.
    pub worktree_root: PathBuf,
    /// Prefix for agent branch names, e.g. `herd` -> `herd/grunt/...`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Path to the `claude` binary. Defaults to lookup via `$PATH`.
    #[serde(default = "default_claude_binary")]
    pub claude_binary: String,
    /// Model used when the caller does not pick one per spawn.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Seconds to wait after SIGTERM before force-killing on `stop`.
    #[serde(default = "default_grace_timeout_secs")]
    pub grace_timeout_secs: u64,
    /// Maximum captured output lines retained per instance; older lines
    /// are dropped once the buffer is full.
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
}

impl AdapterConfig {
    /// Create a config with defaults for everything but the two paths.
    pub fn new(repo_root: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_root: worktree_root.into(),
            branch_prefix: default_branch_prefix(),
            claude_binary: default_claude_binary(),
            default_model: default_model(),
            grace_timeout_secs: default_grace_timeout_secs(),
            output_buffer_lines: default_output_buffer_lines(),
        }
    }

    /// Parse a config from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse adapter config")
    }

    /// Grace period for SIGTERM before escalating to SIGKILL.
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_defaults() {
        let config = AdapterConfig::new("/repo", "/worktrees");
        assert_eq!(config.repo_root, PathBuf::from("/repo"));
        assert_eq!(config.worktree_root, PathBuf::from("/worktrees"));
        assert_eq!(config.branch_prefix, "herd");
        assert_eq!(config.claude_binary, "claude");
        assert_eq!(config.default_model, "claude-sonnet-4");
        assert_eq!(config.grace_timeout(), Duration::from_secs(5));
        assert_eq!(config.output_buffer_lines, 2000);
    }

    #[test]
    fn toml_with_only_paths_uses_defaults() {
        let config = AdapterConfig::from_toml_str(
            r#"
            repo_root = "/src/repo"
            worktree_root = "/tmp/worktrees"
            "#,
        )
        .unwrap();
        assert_eq!(config.branch_prefix, "herd");
        assert_eq!(config.default_model, "claude-sonnet-4");
    }

    #[test]
    fn toml_overrides_are_honoured() {
        let config = AdapterConfig::from_toml_str(
            r#"
            repo_root = "/src/repo"
            worktree_root = "/tmp/worktrees"
            branch_prefix = "flock"
            claude_binary = "/opt/bin/claude"
            default_model = "claude-opus-4"
            grace_timeout_secs = 30
            output_buffer_lines = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.branch_prefix, "flock");
        assert_eq!(config.claude_binary, "/opt/bin/claude");
        assert_eq!(config.default_model, "claude-opus-4");
        assert_eq!(config.grace_timeout(), Duration::from_secs(30));
        assert_eq!(config.output_buffer_lines, 500);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result = AdapterConfig::from_toml_str(r#"repo_root = "/src/repo""#);
        assert!(result.is_err());
    }
}
