//! Git worktree management for instance isolation.
//!
//! Each agent instance runs in its own git worktree on a dedicated branch,
//! giving filesystem isolation without the cost of a full clone. Worktrees
//! share the object store of the main repository but have independent
//! working directories and index files.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it takes a lock file on the shared object store), and the
//! branch namespace is shared across all instances. All mutating git
//! operations are serialised through an internal mutex so concurrent
//! spawns and stops do not race.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::WorktreeError;

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
}

/// Creates and destroys per-instance worktrees under a configured root.
///
/// The manager never touches the caller's primary working tree; it only
/// adds and removes worktrees and the branches backing them.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    branch_prefix: String,
    /// Serialises mutating git operations to avoid lock-file contention
    /// and branch-name races.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_root: self.repo_root.clone(),
            worktree_root: self.worktree_root.clone(),
            branch_prefix: self.branch_prefix.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

/// Lowercase a reference and replace anything unsafe for branch or
/// directory names with `-`.
fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// First eight hex chars of an instance id, used to keep branch and
/// directory names unique per instance.
fn short_id(instance_id: Uuid) -> String {
    instance_id.simple().to_string()[..8].to_string()
}

impl WorktreeManager {
    /// Create a new manager.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_root` is not a git
    /// repository.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
    ) -> Result<Self, WorktreeError> {
        let repo_root = repo_root.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_root));
        }

        Ok(Self {
            repo_root,
            worktree_root: worktree_root.into(),
            branch_prefix: branch_prefix.into(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Build the branch name for an instance.
    ///
    /// Format: `<prefix>/<role>/<task>-<short-id>`. The short instance id
    /// keeps branches unique even when the same role/task pair is spawned
    /// more than once.
    pub fn branch_name(&self, role: &str, task_ref: &str, instance_id: Uuid) -> String {
        format!(
            "{}/{}/{}-{}",
            self.branch_prefix,
            slug(role),
            slug(task_ref),
            short_id(instance_id)
        )
    }

    /// Build the worktree directory path for an instance.
    ///
    /// Format: `<worktree_root>/<role>-<task>-<short-id>`.
    pub fn worktree_path(&self, role: &str, task_ref: &str, instance_id: Uuid) -> PathBuf {
        self.worktree_root.join(format!(
            "{}-{}-{}",
            slug(role),
            slug(task_ref),
            short_id(instance_id)
        ))
    }

    /// Create a worktree at `path` on a new branch `branch_name`.
    ///
    /// Branch names embed the instance id, so an existing branch with the
    /// same name is a configuration error, not something to reuse; it
    /// fails with [`WorktreeError::BranchExists`]. Partial state left by
    /// a failed `git worktree add` is cleaned up on a best-effort basis.
    pub fn create(&self, branch_name: &str, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.branch_exists(branch_name)? {
            return Err(WorktreeError::BranchExists(branch_name.to_string()));
        }

        if !self.worktree_root.exists() {
            std::fs::create_dir_all(&self.worktree_root).map_err(|e| {
                WorktreeError::WorktreeRoot {
                    path: self.worktree_root.clone(),
                    source: e,
                }
            })?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "-b"])
            .arg(branch_name)
            .arg(path)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add -b".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        tracing::info!(
            path = %path.display(),
            branch = branch_name,
            "created worktree"
        );

        self.find_worktree_by_path(path)
    }

    /// Remove a worktree and delete its branch.
    ///
    /// Idempotent: destroying an already-destroyed worktree or branch is
    /// a no-op. The branch is force-deleted since agent work is not
    /// expected to be merged before teardown.
    pub fn destroy(&self, path: &Path, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.remove_worktree_locked(path)?;
        self.delete_branch_locked(branch_name)?;
        Ok(())
    }

    fn remove_worktree_locked(&self, path: &Path) -> Result<(), WorktreeError> {
        if self.find_worktree_by_path(path).is_err() {
            // Not registered with git. Clean up a stray directory if any.
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        tracing::info!(path = %path.display(), "removed worktree");
        Ok(())
    }

    fn delete_branch_locked(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Branch not found is fine for idempotency.
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List all worktrees associated with the main repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Prune references to worktrees whose directories were removed
    /// externally.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::Parse(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// Detached worktrees show `detached` instead of `branch`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // Ignore `bare`, `detached`, `prunable`, etc.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_test_utils::create_temp_repo;
    use tempfile::TempDir;

    fn manager(repo: &Path, root: &Path) -> WorktreeManager {
        WorktreeManager::new(repo, root, "herd").expect("failed to create WorktreeManager")
    }

    #[test]
    fn new_with_valid_repo() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());
        assert_eq!(mgr.repo_root(), repo_path);
        assert_eq!(mgr.worktree_root(), root.path());
    }

    #[test]
    fn new_with_invalid_repo() {
        let dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), root.path(), "herd");
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_and_path_names_embed_instance_id() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        let short = &id.simple().to_string()[..8];
        assert_eq!(branch, format!("herd/grunt/dbc-123-{short}"));
        assert_eq!(
            path,
            root.path().join(format!("grunt-dbc-123-{short}"))
        );
    }

    #[test]
    fn names_are_unique_per_instance() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(
            mgr.branch_name("grunt", "DBC-123", a),
            mgr.branch_name("grunt", "DBC-123", b)
        );
        assert_ne!(
            mgr.worktree_path("grunt", "DBC-123", a),
            mgr.worktree_path("grunt", "DBC-123", b)
        );
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        let info = mgr.create(&branch, &path).expect("create failed");
        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some(branch.as_str()));
        assert!(!info.head_commit.is_empty());

        let worktrees = mgr.list_worktrees().expect("list failed");
        // Main worktree + the new one.
        assert!(worktrees.len() >= 2);
        assert!(
            worktrees
                .iter()
                .any(|wt| wt.branch.as_deref() == Some(branch.as_str()))
        );
    }

    #[test]
    fn create_with_existing_branch_is_fatal() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        mgr.create(&branch, &path).expect("first create failed");

        let other = root.path().join("other");
        let result = mgr.create(&branch, &other);
        assert!(matches!(result, Err(WorktreeError::BranchExists(_))));
        assert!(!other.exists());
    }

    #[test]
    fn destroy_removes_worktree_and_branch() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        mgr.create(&branch, &path).expect("create failed");
        assert!(path.exists());
        assert!(mgr.branch_exists(&branch).unwrap());

        mgr.destroy(&path, &branch).expect("destroy failed");
        assert!(!path.exists());
        assert!(!mgr.branch_exists(&branch).unwrap());
    }

    #[test]
    fn destroy_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        mgr.create(&branch, &path).expect("create failed");
        mgr.destroy(&path, &branch).expect("first destroy failed");
        mgr.destroy(&path, &branch)
            .expect("second destroy should be a no-op");
    }

    #[test]
    fn destroy_never_touches_the_primary_working_tree() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);

        mgr.create(&branch, &path).expect("create failed");
        mgr.destroy(&path, &branch).expect("destroy failed");

        assert!(repo_path.join("README.md").exists());
    }

    #[test]
    fn worktree_writes_are_isolated_from_main_repo() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "DBC-123", id);
        let path = mgr.worktree_path("grunt", "DBC-123", id);
        let info = mgr.create(&branch, &path).expect("create failed");

        std::fs::write(info.path.join("agent-work.txt"), "agent output\n").unwrap();
        assert!(!repo_path.join("agent-work.txt").exists());
    }

    #[test]
    fn create_with_checked_out_branch_fails_without_residue() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        // The branch checked out in the main repo already exists, so the
        // collision is reported before anything lands on disk.
        let output = Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to get current branch");
        let main_branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert!(!main_branch.is_empty());

        let path = root.path().join("partial");
        let result = mgr.create(&main_branch, &path);
        assert!(matches!(result, Err(WorktreeError::BranchExists(_))));
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_stale_prunes_externally_removed_worktrees() {
        let (_dir, repo_path) = create_temp_repo();
        let root = TempDir::new().unwrap();
        let mgr = manager(&repo_path, root.path());

        let id = Uuid::new_v4();
        let branch = mgr.branch_name("grunt", "stale", id);
        let path = mgr.worktree_path("grunt", "stale", id);
        mgr.create(&branch, &path).expect("create failed");

        std::fs::remove_dir_all(&path).expect("manual remove failed");
        mgr.cleanup_stale().expect("cleanup_stale failed");

        let worktrees = mgr.list_worktrees().expect("list failed");
        assert!(
            !worktrees
                .iter()
                .any(|wt| wt.branch.as_deref() == Some(branch.as_str()))
        );
    }

    #[test]
    fn slug_normalises_references() {
        assert_eq!(slug("DBC-123"), "dbc-123");
        assert_eq!(slug("Fix login/logout"), "fix-login-logout");
        assert_eq!(slug("--edge--"), "edge");
    }

    #[test]
    fn parse_porcelain_output_blocks() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/herd/grunt/dbc-123-abcd1234

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(
            result[1].branch.as_deref(),
            Some("herd/grunt/dbc-123-abcd1234")
        );
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn parse_porcelain_output_no_trailing_newline() {
        let input = "worktree /home/user/project\nHEAD abc123\nbranch refs/heads/main";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }
}
