// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace isolation engine.
//!
//! Gives every session a private working copy of a shared git project and
//! reconciles finished work back into the project's main line.

mod commit;
mod isolation;
mod worktree;

pub use commit::{
    provider_for, summarize, AgentCommitMessage, CommitMessageProvider, StaticCommitMessage,
    FALLBACK_COMMIT_MESSAGE, MAX_SUBJECT_LEN,
};
pub use isolation::{
    base_session_name, ManagedWorkspace, NameAllocator, WorkspaceIsolator, WorkspaceLayout,
};
pub use worktree::GitWorktreeIsolator;
