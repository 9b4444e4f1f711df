// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace isolation trait and naming conventions.
//!
//! Every session works in its own branch-scoped directory inside the project:
//!
//! ```text
//! /proj/demo/                          # Project root (main checked out)
//! ├── .git/
//! ├── .sessions/                       # Workspace dir (git-excluded)
//! │   ├── demo-260101-120000/          # Session worktree, branch sess/demo-260101-120000
//! │   └── demo-260101-120000-2/        # Same second, second session
//! └── src/
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::WorkspaceError;

use super::commit::CommitMessageProvider;

/// A workspace found under a project that follows the naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedWorkspace {
    pub path: PathBuf,
    pub branch: String,
}

/// Trait for workspace isolation strategies.
///
/// Implementations create, merge back, and remove the private working copy
/// of each session.
#[async_trait]
pub trait WorkspaceIsolator: Send + Sync {
    /// Create `workspace_path` checked out on a new `branch` rooted at the
    /// main-line tip of `project_root`.
    async fn create(
        &self,
        project_root: &Path,
        workspace_path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError>;

    /// Stage and commit everything in the workspace.
    ///
    /// Returns `false` when there was nothing to commit.
    async fn commit_pending_changes(
        &self,
        workspace_path: &Path,
        label: &str,
        messages: &dyn CommitMessageProvider,
    ) -> Result<bool, WorkspaceError>;

    /// Rebase `branch` onto main, then fast-forward main to it.
    ///
    /// On conflict the rebase is aborted and the branch and workspace are
    /// left intact.
    async fn merge_to_main(
        &self,
        project_root: &Path,
        branch: &str,
        workspace_path: &Path,
    ) -> Result<String, WorkspaceError>;

    /// Remove the workspace directory and delete the branch. Idempotent.
    async fn destroy(
        &self,
        project_root: &Path,
        workspace_path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError>;

    /// Workspaces under `project_root` that match the naming convention.
    async fn list_managed_workspaces(
        &self,
        project_root: &Path,
    ) -> Result<Vec<ManagedWorkspace>, WorkspaceError>;
}

/// Naming convention shared by the isolator and the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Directory inside the project root that holds workspaces.
    pub workspace_dir: String,
    /// Prefix for session branches.
    pub branch_prefix: String,
}

impl WorkspaceLayout {
    pub fn new(workspace_dir: impl Into<String>, branch_prefix: impl Into<String>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    /// Directory holding all workspaces of a project.
    pub fn workspaces_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.workspace_dir)
    }

    /// Workspace path for a session name.
    pub fn workspace_path(&self, project_root: &Path, session_name: &str) -> PathBuf {
        self.workspaces_root(project_root).join(session_name)
    }

    /// Branch name for a session name.
    pub fn branch_name(&self, session_name: &str) -> String {
        format!("{}{}", self.branch_prefix, session_name)
    }

    /// Whether a worktree at `path` on `branch` belongs to this layout.
    pub fn is_managed(&self, project_root: &Path, path: &Path, branch: &str) -> bool {
        if !branch.starts_with(&self.branch_prefix) {
            return false;
        }
        let root = self.workspaces_root(project_root);
        let root = root.canonicalize().unwrap_or(root);
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        path.parent() == Some(root.as_path())
    }
}

impl Default for WorkspaceLayout {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_WORKSPACE_DIR,
            crate::config::DEFAULT_BRANCH_PREFIX,
        )
    }
}

/// Base session name: `<project-lowercase>-<YYMMDD-HHMMSS>`.
pub fn base_session_name(project_name: &str, now: DateTime<Local>) -> String {
    let project: String = project_name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{}-{}", project, now.format("%y%m%d-%H%M%S"))
}

/// Hands out session names that are unique for the life of the process.
#[derive(Debug, Default)]
pub struct NameAllocator {
    allocated: Mutex<HashSet<String>>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a name, appending `-2`, `-3`, ... when the base name was
    /// already handed out or `taken` reports it in use.
    pub fn allocate(&self, base: &str, taken: impl Fn(&str) -> bool) -> String {
        let mut allocated = self
            .allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut candidate = base.to_string();
        let mut suffix = 2;
        while allocated.contains(&candidate) || taken(&candidate) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        allocated.insert(candidate.clone());
        candidate
    }

    /// Mark an existing name as used (recovered sessions).
    pub fn reserve(&self, name: &str) {
        self.allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }
}
