//! Worktree isolation against real git repositories.

use std::path::Path;
use std::process::Command;
use std::time::Instant;
use zeroshot_core::isolation::{worktree_root, BRANCH_PREFIX};
use zeroshot_core::IsolationManager;
use zeroshot_proto::Error;

fn run_git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .expect("failed to run git");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A fresh repository with one commit containing `test.txt`.
fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    run_git(repo, &["init"]);
    run_git(repo, &["config", "user.name", "Test"]);
    run_git(repo, &["config", "user.email", "test@example.com"]);
    std::fs::write(repo.join("test.txt"), "hello worktree\n").unwrap();
    run_git(repo, &["add", "test.txt"]);
    run_git(repo, &["commit", "-m", "initial commit"]);
    dir
}

/// Unique cluster id per test; the worktree root is shared in /tmp.
fn cluster_id(tag: &str) -> String {
    format!("{tag}-{}", std::process::id())
}

#[tokio::test]
async fn test_create_worktree_layout_and_content() {
    let repo = init_repo();
    let manager = IsolationManager::default();
    let id = cluster_id("wt-create");

    let info = manager.create_worktree(&id, repo.path()).await.unwrap();

    assert!(info.path.starts_with(worktree_root()));
    assert_eq!(info.branch, format!("{BRANCH_PREFIX}{id}"));
    assert_eq!(info.repo_root, repo.path());

    // The worktree is checked out on its branch and mirrors HEAD.
    let head = git_stdout(&info.path, &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(head.trim(), info.branch);
    let content = std::fs::read_to_string(info.path.join("test.txt")).unwrap();
    assert_eq!(content, "hello worktree\n");

    // Registration is visible from the source repo.
    let list = git_stdout(repo.path(), &["worktree", "list", "--porcelain"]);
    assert!(list.contains(&id));

    manager.cleanup_worktree(&id).await;
}

#[tokio::test]
async fn test_commits_in_worktree_stay_out_of_source_tree() {
    let repo = init_repo();
    let manager = IsolationManager::default();
    let id = cluster_id("wt-commit");

    let info = manager.create_worktree(&id, repo.path()).await.unwrap();

    std::fs::write(info.path.join("new.txt"), "isolated change\n").unwrap();
    run_git(&info.path, &["add", "new.txt"]);
    run_git(&info.path, &["commit", "-m", "agent work"]);

    assert!(!repo.path().join("new.txt").exists());

    manager.cleanup_worktree(&id).await;
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_preserves_branch() {
    let repo = init_repo();
    let manager = IsolationManager::default();
    let id = cluster_id("wt-cleanup");

    let info = manager.create_worktree(&id, repo.path()).await.unwrap();
    let branch = info.branch.clone();

    manager.cleanup_worktree(&id).await;
    manager.cleanup_worktree(&id).await;
    manager.cleanup_worktree("never-existed").await;

    assert!(!info.path.exists());
    assert!(manager.get_worktree_info(&id).is_none());

    // The branch survives teardown for later review.
    let branches = git_stdout(repo.path(), &["branch", "--list", &branch]);
    assert!(
        branches.contains(&branch),
        "branch {branch} should be preserved, got: {branches}"
    );
}

#[tokio::test]
async fn test_recreate_after_orphaned_directory() {
    let repo = init_repo();
    let manager = IsolationManager::default();
    let id = cluster_id("wt-orphan");

    let info = manager.create_worktree(&id, repo.path()).await.unwrap();

    // Simulate a crashed run: the directory lingers with no record.
    manager.cleanup_worktree(&id).await;
    std::fs::create_dir_all(&info.path).unwrap();
    std::fs::write(info.path.join("stale.txt"), "leftover").unwrap();

    let recreated = manager.create_worktree(&id, repo.path()).await.unwrap();
    assert!(!recreated.path.join("stale.txt").exists());
    assert!(recreated.path.join("test.txt").exists());

    manager.cleanup_worktree(&id).await;
}

#[tokio::test]
async fn test_create_worktree_rejects_non_git_dir() {
    let plain = tempfile::tempdir().unwrap();
    let manager = IsolationManager::default();

    let err = manager
        .create_worktree(&cluster_id("wt-nongit"), plain.path())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotAGitRepo(_)));
    let message = err.to_string();
    assert!(message.contains("git") || message.contains("repository"));
}

#[tokio::test]
async fn test_worktree_provisioning_is_fast() {
    let repo = init_repo();
    let manager = IsolationManager::default();
    let id = cluster_id("wt-latency");

    let started = Instant::now();
    manager.create_worktree(&id, repo.path()).await.unwrap();
    let elapsed = started.elapsed();

    // Worktree provisioning on a one-commit repo takes well under a
    // second; the bound is generous for loaded CI machines.
    assert!(
        elapsed.as_secs() < 5,
        "worktree creation took {elapsed:?}"
    );

    manager.cleanup_worktree(&id).await;
}
