// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree isolator against throwaway repositories.

mod common;

use afk::error::WorkspaceError;
use afk::workspace::{GitWorktreeIsolator, StaticCommitMessage, WorkspaceIsolator, WorkspaceLayout};
use tempfile::TempDir;

use common::{branch_exists, commit_file, git, init_repo};

fn setup() -> (TempDir, std::path::PathBuf, GitWorktreeIsolator) {
    let temp = TempDir::new().unwrap();
    let project = init_repo(&temp.path().join("demo"));
    let isolator = GitWorktreeIsolator::new(WorkspaceLayout::default(), "main");
    (temp, project, isolator)
}

#[tokio::test]
async fn test_create_excludes_workspace_dir() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");

    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    assert!(ws.join("README.md").exists());
    assert!(branch_exists(&project, "sess/demo-1"));
    assert_eq!(git(&ws, &["branch", "--show-current"]), "sess/demo-1");

    let exclude = std::fs::read_to_string(project.join(".git/info/exclude")).unwrap();
    assert_eq!(exclude.lines().filter(|l| *l == "/.sessions/").count(), 1);
    assert_eq!(git(&project, &["status", "--porcelain"]), "");

    // A second workspace does not duplicate the exclude entry
    isolator
        .create(&project, &project.join(".sessions/demo-2"), "sess/demo-2")
        .await
        .unwrap();
    let exclude = std::fs::read_to_string(project.join(".git/info/exclude")).unwrap();
    assert_eq!(exclude.lines().filter(|l| *l == "/.sessions/").count(), 1);
}

#[tokio::test]
async fn test_create_existing_branch_fails() {
    let (_temp, project, isolator) = setup();
    git(&project, &["branch", "sess/taken"]);

    let ws = project.join(".sessions/taken");
    let err = isolator.create(&project, &ws, "sess/taken").await.unwrap_err();
    assert!(matches!(err, WorkspaceError::Create(_)));
    assert!(!ws.exists());
}

#[tokio::test]
async fn test_commit_pending_changes() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();

    assert!(!isolator
        .commit_pending_changes(&ws, "demo-1", &StaticCommitMessage)
        .await
        .unwrap());

    std::fs::write(ws.join("new.txt"), "hello\n").unwrap();
    assert!(isolator
        .commit_pending_changes(&ws, "demo-1", &StaticCommitMessage)
        .await
        .unwrap());
    assert_eq!(
        git(&ws, &["log", "-1", "--format=%s"]),
        "Session demo-1 changes"
    );
    assert_eq!(git(&ws, &["status", "--porcelain"]), "");
}

#[tokio::test]
async fn test_merge_fast_forwards_checked_out_main() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    commit_file(&ws, "feature.txt", "feature\n", "add feature");

    // Main moved on without touching the same file
    commit_file(&project, "other.txt", "other\n", "main work");

    isolator
        .merge_to_main(&project, "sess/demo-1", &ws)
        .await
        .unwrap();

    assert!(project.join("feature.txt").exists());
    assert!(project.join("other.txt").exists());
    assert_eq!(git(&project, &["log", "-1", "--format=%s"]), "add feature");
    assert_eq!(
        git(&project, &["rev-parse", "main"]),
        git(&project, &["rev-parse", "sess/demo-1"])
    );
}

#[tokio::test]
async fn test_merge_updates_ref_when_root_on_other_branch() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    commit_file(&ws, "feature.txt", "feature\n", "add feature");

    git(&project, &["checkout", "-q", "-b", "scratch"]);

    isolator
        .merge_to_main(&project, "sess/demo-1", &ws)
        .await
        .unwrap();

    assert_eq!(git(&project, &["branch", "--show-current"]), "scratch");
    assert_eq!(
        git(&project, &["rev-parse", "main"]),
        git(&project, &["rev-parse", "sess/demo-1"])
    );
    assert!(!project.join("feature.txt").exists());
}

#[tokio::test]
async fn test_merge_conflict_leaves_everything_intact() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    commit_file(&ws, "README.md", "# session\n", "session edit");
    commit_file(&project, "README.md", "# main\n", "main edit");
    let main_before = git(&project, &["rev-parse", "main"]);
    let branch_before = git(&project, &["rev-parse", "sess/demo-1"]);

    let err = isolator
        .merge_to_main(&project, "sess/demo-1", &ws)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_summary().as_deref(), Some("conflict in README.md"));

    assert_eq!(git(&project, &["rev-parse", "main"]), main_before);
    assert_eq!(git(&project, &["rev-parse", "sess/demo-1"]), branch_before);
    assert_eq!(git(&ws, &["branch", "--show-current"]), "sess/demo-1");
    assert_eq!(git(&ws, &["status", "--porcelain"]), "");
    assert_eq!(std::fs::read_to_string(ws.join("README.md")).unwrap(), "# session\n");
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    std::fs::write(ws.join("scratch.txt"), "uncommitted\n").unwrap();

    isolator.destroy(&project, &ws, "sess/demo-1").await.unwrap();
    assert!(!ws.exists());
    assert!(!branch_exists(&project, "sess/demo-1"));

    isolator.destroy(&project, &ws, "sess/demo-1").await.unwrap();
}

#[tokio::test]
async fn test_destroy_after_directory_vanished() {
    let (_temp, project, isolator) = setup();
    let ws = project.join(".sessions/demo-1");
    isolator.create(&project, &ws, "sess/demo-1").await.unwrap();
    std::fs::remove_dir_all(&ws).unwrap();

    isolator.destroy(&project, &ws, "sess/demo-1").await.unwrap();
    assert!(!branch_exists(&project, "sess/demo-1"));
    assert!(!git(&project, &["worktree", "list"]).contains("demo-1"));
}

#[tokio::test]
async fn test_list_managed_workspaces_filters_foreign_worktrees() {
    let (temp, project, isolator) = setup();
    let managed = project.join(".sessions/demo-1");
    isolator.create(&project, &managed, "sess/demo-1").await.unwrap();

    // Right branch prefix, wrong location
    let elsewhere = temp.path().join("elsewhere");
    git(
        &project,
        &["worktree", "add", "-q", "-b", "sess/stray", elsewhere.to_str().unwrap()],
    );
    // Right location, foreign branch
    let foreign = project.join(".sessions/foreign");
    git(
        &project,
        &["worktree", "add", "-q", "-b", "feature/x", foreign.to_str().unwrap()],
    );

    let listed = isolator.list_managed_workspaces(&project).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].branch, "sess/demo-1");
    assert_eq!(
        listed[0].path.canonicalize().unwrap(),
        managed.canonicalize().unwrap()
    );
}
