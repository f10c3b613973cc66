//! Git worktree isolation.
//!
//! Each cluster gets a fresh worktree under the OS temp root at
//! `zeroshot-worktrees/<cluster_id>` on a new `zeroshot/<cluster_id>`
//! branch based on the source repository's current HEAD. Teardown removes
//! the directory and prunes the registration but always preserves the
//! branch, so finished work survives for later review.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use zeroshot_proto::{Error, Result};

/// Temp-root segment every worktree lives under.
pub const WORKTREE_ROOT_SEGMENT: &str = "zeroshot-worktrees";

/// Prefix for every cluster branch.
pub const BRANCH_PREFIX: &str = "zeroshot/";

/// An active worktree sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeInfo {
    /// `<tmp>/zeroshot-worktrees/<cluster_id>`.
    pub path: PathBuf,
    /// `zeroshot/<cluster_id>`, preserved across teardown.
    pub branch: String,
    /// The enclosing repository the branch lives in.
    pub repo_root: PathBuf,
}

/// Base directory for all cluster worktrees.
pub fn worktree_root() -> PathBuf {
    std::env::temp_dir().join(WORKTREE_ROOT_SEGMENT)
}

async fn git(repo_root: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .await
        .map_err(|e| Error::IsolationFailed(format!("failed to run git: {e}")))
}

/// Verifies that `repo_root` is a directory inside a git repository.
pub async fn ensure_git_repo(repo_root: &Path) -> Result<()> {
    let inside = Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(repo_root)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);

    if inside {
        Ok(())
    } else {
        Err(Error::NotAGitRepo(repo_root.to_path_buf()))
    }
}

/// Creates the worktree for a cluster.
///
/// An orphaned directory at the target path (from a prior run) is removed
/// and its registration pruned before creation. Git failures are retried
/// once after `git worktree prune`, then surfaced as `IsolationFailed`.
pub async fn create(cluster_id: &str, repo_root: &Path) -> Result<WorktreeInfo> {
    ensure_git_repo(repo_root).await?;

    let path = worktree_root().join(cluster_id);
    let branch = format!("{BRANCH_PREFIX}{cluster_id}");

    if path.exists() {
        warn!(
            cluster = cluster_id,
            path = %path.display(),
            "Removing orphaned worktree from a prior run"
        );
        std::fs::remove_dir_all(&path)?;
        let _ = git(repo_root, &["worktree", "prune"]).await;
    }
    std::fs::create_dir_all(worktree_root())?;

    // -B resets a leftover branch from a previous cluster with the same id.
    let add_args = ["worktree", "add", "-B", branch.as_str(), path_str(&path)?];
    let output = git(repo_root, &add_args).await?;
    if !output.status.success() {
        debug!(
            cluster = cluster_id,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "git worktree add failed, pruning and retrying once"
        );
        let _ = git(repo_root, &["worktree", "prune"]).await;
        let retry = git(repo_root, &add_args).await?;
        if !retry.status.success() {
            return Err(Error::IsolationFailed(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&retry.stderr).trim()
            )));
        }
    }

    info!(
        cluster = cluster_id,
        path = %path.display(),
        branch = %branch,
        "Created worktree"
    );

    Ok(WorktreeInfo {
        path,
        branch,
        repo_root: repo_root.to_path_buf(),
    })
}

/// Tears down a worktree, preserving its branch.
///
/// Best-effort and idempotent: git tooling errors are swallowed after the
/// directory has been removed.
pub async fn cleanup(info: &WorktreeInfo) {
    let removal = Command::new("git")
        .args(["worktree", "remove", "--force"])
        .arg(&info.path)
        .current_dir(&info.repo_root)
        .output()
        .await;

    match removal {
        Ok(o) if o.status.success() => {}
        Ok(o) => {
            debug!(
                path = %info.path.display(),
                stderr = %String::from_utf8_lossy(&o.stderr),
                "git worktree remove failed, removing directory manually"
            );
        }
        Err(e) => {
            debug!(path = %info.path.display(), error = %e, "Could not run git worktree remove");
        }
    }

    if info.path.exists() {
        if let Err(e) = std::fs::remove_dir_all(&info.path) {
            warn!(path = %info.path.display(), error = %e, "Could not remove worktree directory");
        }
    }

    let _ = git(&info.repo_root, &["worktree", "prune"]).await;

    info!(
        path = %info.path.display(),
        branch = %info.branch,
        "Removed worktree, branch preserved"
    );
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::IsolationFailed(format!("worktree path is not UTF-8: {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_git_repo_rejects_plain_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_git_repo(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::NotAGitRepo(_)));
        assert!(err.to_string().contains("git repository"));
    }

    #[tokio::test]
    async fn test_ensure_git_repo_rejects_missing_dir() {
        let err = ensure_git_repo(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAGitRepo(_)));
    }

    #[test]
    fn test_worktree_root_is_under_tmp() {
        let root = worktree_root();
        assert!(root.starts_with(std::env::temp_dir()));
        assert!(root.ends_with(WORKTREE_ROOT_SEGMENT));
    }
}
