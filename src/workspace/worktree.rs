// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree isolator.
//!
//! Each session gets `git worktree add -b <branch> <path> <main>` inside the
//! project's workspace dir. Completion rebases the branch onto main inside the
//! worktree (where the branch is checked out) and then fast-forwards main.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::commit::CommitMessageProvider;
use super::isolation::{ManagedWorkspace, WorkspaceIsolator, WorkspaceLayout};

/// Git worktree isolator for single-repo projects.
pub struct GitWorktreeIsolator {
    layout: WorkspaceLayout,
    main_branch: String,
    /// Worktree creation and merges into main are serialized per project.
    project_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitWorktreeIsolator {
    /// Create a new Git worktree isolator.
    pub fn new(layout: WorkspaceLayout, main_branch: impl Into<String>) -> Self {
        Self {
            layout,
            main_branch: main_branch.into(),
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    /// Run a git command in `cwd` and return the raw output.
    async fn git_output(cwd: &Path, args: &[&str]) -> Result<Output, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    /// Run a git command in `cwd` and return stdout.
    async fn git(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Self::git_output(cwd, args).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(WorkspaceError::Git(failure_text(&output)))
        }
    }

    async fn is_git_repo(project_root: &Path) -> bool {
        project_root.is_dir() && Self::git(project_root, &["rev-parse", "--git-dir"]).await.is_ok()
    }

    async fn branch_exists(project_root: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        Self::git(project_root, &["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }

    /// Add `/<workspace_dir>/` to `.git/info/exclude` so workspaces never show
    /// up as untracked files of the main checkout.
    async fn ensure_excluded(&self, project_root: &Path) -> Result<(), WorkspaceError> {
        let common = Self::git(project_root, &["rev-parse", "--git-common-dir"]).await?;
        let common = PathBuf::from(common);
        let git_dir = if common.is_absolute() {
            common
        } else {
            project_root.join(common)
        };

        let info_dir = git_dir.join("info");
        let exclude = info_dir.join("exclude");
        let pattern = format!("/{}/", self.layout.workspace_dir);

        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }

        std::fs::create_dir_all(&info_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", pattern)?;
        debug!("Excluded {} in {:?}", pattern, exclude);
        Ok(())
    }

    fn project_lock(&self, project_root: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key).or_default().clone()
    }

    /// Files with unresolved conflicts in an interrupted rebase.
    async fn conflicted_files(workspace_path: &Path) -> Vec<String> {
        Self::git(workspace_path, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|out| {
                out.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Move main forward to `branch`.
    ///
    /// Uses `merge --ff-only` when main is checked out in the project root,
    /// otherwise updates the ref directly after checking it is a fast-forward.
    async fn fast_forward_main(&self, project_root: &Path, branch: &str) -> Result<String, WorkspaceError> {
        let current = Self::git(project_root, &["branch", "--show-current"]).await?;

        if current == self.main_branch {
            let output = Self::git_output(project_root, &["merge", "--ff-only", branch]).await?;
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
            }
            return Err(WorkspaceError::MergeConflict {
                branch: branch.to_string(),
                files: Vec::new(),
                detail: failure_text(&output),
            });
        }

        let ancestor = Self::git_output(
            project_root,
            &["merge-base", "--is-ancestor", &self.main_branch, branch],
        )
        .await?;
        if !ancestor.status.success() {
            return Err(WorkspaceError::MergeConflict {
                branch: branch.to_string(),
                files: Vec::new(),
                detail: format!("{} is not a fast-forward of {}", branch, self.main_branch),
            });
        }

        let main_ref = format!("refs/heads/{}", self.main_branch);
        Self::git(project_root, &["update-ref", &main_ref, branch]).await?;
        Ok(format!("Updated {} to {}", self.main_branch, branch))
    }
}

/// Stderr, or stdout when git wrote nothing to stderr.
fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}

#[async_trait]
impl WorkspaceIsolator for GitWorktreeIsolator {
    async fn create(
        &self,
        project_root: &Path,
        workspace_path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let lock = self.project_lock(project_root);
        let _guard = lock.lock().await;

        if !Self::is_git_repo(project_root).await {
            return Err(WorkspaceError::Create(format!(
                "{} is not a git repository",
                project_root.display()
            )));
        }
        if Self::branch_exists(project_root, branch).await {
            return Err(WorkspaceError::Create(format!("branch {} already exists", branch)));
        }

        if let Some(parent) = workspace_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = self.ensure_excluded(project_root).await {
            warn!("Could not update git exclude for {:?}: {}", project_root, e);
        }

        info!("Creating worktree for {} at {:?}", branch, workspace_path);
        let path_str = workspace_path.to_string_lossy().to_string();
        self.git_create(project_root, &path_str, branch).await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workspace.create", start.elapsed());

        Ok(())
    }

    async fn commit_pending_changes(
        &self,
        workspace_path: &Path,
        label: &str,
        messages: &dyn CommitMessageProvider,
    ) -> Result<bool, WorkspaceError> {
        Self::git(workspace_path, &["add", "-A"]).await?;

        let staged = Self::git_output(workspace_path, &["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            debug!("Nothing to commit in {:?}", workspace_path);
            return Ok(false);
        }

        let message = messages.message(workspace_path, label).await;
        Self::git(workspace_path, &["commit", "-m", &message]).await?;
        info!("Committed pending changes for {}: {}", label, message);
        Ok(true)
    }

    async fn merge_to_main(
        &self,
        project_root: &Path,
        branch: &str,
        workspace_path: &Path,
    ) -> Result<String, WorkspaceError> {
        let lock = self.project_lock(project_root);
        let _guard = lock.lock().await;

        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        // Leftover from an interrupted earlier attempt
        let _ = Self::git_output(workspace_path, &["rebase", "--abort"]).await;

        let rebase = Self::git_output(workspace_path, &["rebase", &self.main_branch]).await?;
        if !rebase.status.success() {
            let files = Self::conflicted_files(workspace_path).await;
            let _ = Self::git_output(workspace_path, &["rebase", "--abort"]).await;
            warn!("Rebase of {} onto {} failed: {:?}", branch, self.main_branch, files);
            return Err(WorkspaceError::MergeConflict {
                branch: branch.to_string(),
                files,
                detail: failure_text(&rebase),
            });
        }

        let result = self.fast_forward_main(project_root, branch).await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workspace.merge", start.elapsed());

        if result.is_ok() {
            info!("Merged {} into {}", branch, self.main_branch);
        }
        result
    }

    async fn destroy(
        &self,
        project_root: &Path,
        workspace_path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError> {
        info!("Removing worktree for {} at {:?}", branch, workspace_path);

        if workspace_path.exists() {
            let path_str = workspace_path.to_string_lossy().to_string();
            if let Err(e) = Self::git(project_root, &["worktree", "remove", "--force", &path_str]).await {
                warn!("Failed to remove worktree via git: {}", e);
                if workspace_path.exists() {
                    std::fs::remove_dir_all(workspace_path)?;
                }
            }
        }
        // Drops references to directories removed out from under git
        let _ = Self::git(project_root, &["worktree", "prune"]).await;

        if Self::branch_exists(project_root, branch).await {
            if let Err(e) = Self::git(project_root, &["branch", "-D", branch]).await {
                warn!("Failed to delete branch {}: {}", branch, e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn list_managed_workspaces(
        &self,
        project_root: &Path,
    ) -> Result<Vec<ManagedWorkspace>, WorkspaceError> {
        let output = Self::git(project_root, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output)
            .into_iter()
            .filter(|ws| self.layout.is_managed(project_root, &ws.path, &ws.branch))
            .collect())
    }
}

impl GitWorktreeIsolator {
    async fn git_create(&self, project_root: &Path, path: &str, branch: &str) -> Result<(), WorkspaceError> {
        Self::git(
            project_root,
            &["worktree", "add", "-b", branch, path, &self.main_branch],
        )
        .await
        .map(|_| debug!("Created worktree for {} at {}", branch, path))
        .map_err(|e| WorkspaceError::Create(e.to_string()))
    }
}

/// Parse `git worktree list --porcelain`, keeping entries on a branch.
fn parse_worktree_list(output: &str) -> Vec<ManagedWorkspace> {
    let mut result = Vec::new();
    let mut path: Option<PathBuf> = None;

    for line in output.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p));
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(p) = path.take() {
                result.push(ManagedWorkspace {
                    path: p,
                    branch: branch.to_string(),
                });
            }
        } else if line.is_empty() {
            path = None;
        }
    }
    result
}
