// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session orchestration.
//!
//! A session binds one chat channel to one isolated workspace and one agent
//! process.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SessionManager                          │
//! │   (create, send, respond, stop, complete, recover, suspend)  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                 │                 │
//!          ▼                 ▼                 ▼
//! ┌─────────────────┐ ┌─────────────┐ ┌─────────────────┐
//! │ WorkspaceIsolator│ │ AgentRuntime│ │  SessionStore   │
//! │   (git worktree) │ │ (read loop) │ │   (SQLite DB)   │
//! └─────────────────┘ └─────────────┘ └─────────────────┘
//!                            │
//!                            ▼
//!                        EventBus
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use afk::session::{ManagerDeps, ManagerOptions, SessionManager};
//!
//! let manager = SessionManager::new(deps, ManagerOptions::from_config(&config));
//! let record = manager.create_session("chan-1", "demo", &root, false).await?;
//! manager.send_to_session("chan-1", "add a README").await;
//! manager.complete_session("chan-1").await?;
//! ```

mod hooks;
mod log;
mod manager;
mod read_loop;
mod store;
mod types;

pub use hooks::{CleanupHook, CleanupHooks, FnHook};
pub use log::SessionLog;
pub use manager::{ManagerDeps, ManagerOptions, SessionManager};
pub use store::{SessionStore, DB_FILE, SCHEMA_VERSION};
pub use types::{
    PendingPermission, RecoveryReport, SessionRecord, SessionState, SessionStatus, Transition,
};
