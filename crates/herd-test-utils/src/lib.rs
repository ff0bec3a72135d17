//! Shared test utilities for the adapter's unit and integration tests.
//!
//! Provides throwaway git repositories and fake `claude` executables so
//! tests exercise the real spawn/supervise/teardown paths without the
//! actual agent CLI installed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use herd_agent_claude::SpawnContext;
use tempfile::TempDir;

/// Install a tracing subscriber honouring `RUST_LOG`, once per process.
///
/// Safe to call from every test; repeat calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a temporary git repository with an initial commit.
///
/// Returns the `TempDir` (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init"]);
    run(&["config", "user.email", "test@herd.dev"]);
    run(&["config", "user.name", "Herd Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("failed to write README");
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Write an executable shell script standing in for the `claude` binary.
///
/// `body` is appended after a `#!/bin/sh` shebang. Returns the script
/// path, ready to be used as `AdapterConfig::claude_binary`.
pub fn write_fake_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write fake agent");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make fake agent executable");
    }

    path
}

/// A populated [`SpawnContext`] for tests.
pub fn test_context() -> SpawnContext {
    SpawnContext {
        role_definition: "You are Grunt, the backend developer.".to_string(),
        craft_standards: "Follow the style guide. Write tests.".to_string(),
        project_guidelines: "Use Rust 1.85+.".to_string(),
        assignment: "Implement feature X for DBC-123.".to_string(),
        environment: HashMap::from([("HERD_SLACK_TOKEN".to_string(), "xoxb-test".to_string())]),
        skills: vec!["rust".to_string(), "testing".to_string()],
    }
}
