// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent runtime port.
//!
//! The session manager only depends on these traits; concrete agent CLIs are
//! variants implementing them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::AgentError;

use super::protocol::ResponseStream;

/// Where a process's raw output and stderr are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLogPaths {
    pub raw: PathBuf,
    pub stderr: PathBuf,
}

/// A freshly started agent: the control handle plus its output sequence.
pub struct AgentSession {
    pub process: Box<dyn AgentProcess>,
    pub responses: ResponseStream,
}

/// Launches agent processes.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start an agent rooted at `working_dir`.
    ///
    /// With a `resume_token` the runtime reattaches prior conversational
    /// context. The token is opaque; continuity is up to the runtime.
    async fn start(
        &self,
        working_dir: &Path,
        resume_token: Option<&str>,
        logs: Option<&AgentLogPaths>,
    ) -> Result<AgentSession, AgentError>;
}

/// Control handle of one live agent process.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Write one user turn.
    async fn send_user_message(&self, text: &str) -> Result<(), AgentError>;

    /// Write one permission decision.
    async fn send_permission_response(&self, request_id: &str, allowed: bool) -> Result<(), AgentError>;

    /// Request graceful termination, forcing it after the grace period.
    async fn stop(&self) -> Result<(), AgentError>;

    async fn is_alive(&self) -> bool;
}
