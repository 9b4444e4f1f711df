// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! afk - away-from-keyboard agent daemon.
//!
//! Runs many AI agent sessions at once, each in its own git worktree with
//! its own supervised agent process, and merges finished work back into
//! the project's main line.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types for each layer
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing and metrics infrastructure
//! - [`workspace`] - Per-session git worktrees, commit and merge-back
//! - [`agent`] - Agent process supervision and the stream-json protocol
//! - [`events`] - Typed pub/sub between sessions and the control plane
//! - [`session`] - Session lifecycle, persistence and recovery
//! - [`projects`] - Project name lookup
//! - [`commands`] - The facade control-plane adapters call
//!
//! # Example
//!
//! ```rust,ignore
//! use afk::commands::Commands;
//!
//! let record = commands.create_session("demo", None, false).await?;
//! commands.send_message(&record.channel_id, "add a README").await?;
//! let outcome = commands.complete_session(&record.channel_id).await?;
//! ```

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod projects;
pub mod session;
pub mod telemetry;
pub mod workspace;

// Re-export commonly used types at crate root
pub use commands::{CommandRejection, CommandResult, Commands};
pub use error::{AgentError, ConfigError, Result, SessionError, StoreError, WorkspaceError};
pub use events::{EventBus, EventKind, EventLevel, SessionEvent, StopReason, Subscription};
pub use session::{SessionManager, SessionRecord, SessionState, SessionStatus};

/// afk version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
