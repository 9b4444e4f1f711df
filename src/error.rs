// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the afk daemon.
//!
//! This module provides strongly-typed errors for each layer of the session
//! orchestration core, using `thiserror` for ergonomic error definitions and
//! `anyhow` for error propagation in the binary.

use thiserror::Error;

/// Errors raised by the workspace isolation engine.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// The isolated workspace could not be created. Fatal to session creation.
    #[error("Workspace creation failed: {0}")]
    Create(String),

    /// Rebasing the session branch onto the main line did not complete cleanly.
    ///
    /// The branch and workspace are left intact for manual resolution.
    #[error("Merge conflict on {branch}: {detail}")]
    MergeConflict {
        branch: String,
        files: Vec<String>,
        detail: String,
    },

    #[error("Git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Human-readable summary of a merge conflict.
    ///
    /// Names the conflicting files when git reported them, otherwise falls
    /// back to git's own output.
    pub fn conflict_summary(&self) -> Option<String> {
        match self {
            Self::MergeConflict { files, detail, .. } => {
                if files.is_empty() {
                    Some(detail.clone())
                } else {
                    Some(format!("conflict in {}", files.join(", ")))
                }
            }
            _ => None,
        }
    }
}

/// Errors raised while supervising an agent process.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The agent process could not be launched. Fatal to session creation.
    #[error("Failed to start agent: {0}")]
    Start(String),

    /// Broken pipe, malformed protocol line, or unexpected stream closure.
    #[error("Agent communication error: {0}")]
    Communication(String),

    #[error("Agent process is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether this error means the pipe to the process is unusable.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::NotRunning | Self::Io(_))
    }
}

/// Errors raised by the persisted session store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open session store: {0}")]
    Open(String),

    #[error("Session store query failed: {0}")]
    Query(String),

    #[error("Corrupted session record {channel_id}: {message}")]
    Corrupted { channel_id: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Query(err.to_string())
    }
}

/// Errors raised by the session orchestrator.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists for channel: {0}")]
    AlreadyExists(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// A persisted session failed to reattach at startup.
    #[error("Recovery failed for {channel_id}: {reason}")]
    Recovery { channel_id: String, reason: String },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
