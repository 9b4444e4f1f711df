// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session data types and the per-session state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    WaitingPermission,
    /// Terminal for the current agent process.
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingPermission => "waiting_permission",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Next state after `transition`. `Stopped` absorbs everything.
    pub fn apply(self, transition: Transition) -> Self {
        use SessionState::*;
        use Transition::*;

        match (self, transition) {
            (Stopped, _) | (_, Stop) => Stopped,
            (Idle, UserMessage) => Running,
            (state, UserMessage) => state,
            (_, ToolUse) | (_, PermissionRequest) => WaitingPermission,
            (Idle, AssistantOutput) => Running,
            (state, AssistantOutput) => state,
            (WaitingPermission, PermissionAnswered) => Running,
            (state, PermissionAnswered) => state,
            (_, TurnResult) => Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "waiting_permission" => Ok(Self::WaitingPermission),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown session state: {}", other)),
        }
    }
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A user turn was written to the agent.
    UserMessage,
    /// Assistant output without tool use.
    AssistantOutput,
    /// Assistant output containing a tool-use block.
    ToolUse,
    /// An explicit permission request.
    PermissionRequest,
    /// A permission decision was forwarded.
    PermissionAnswered,
    /// The turn's `result` message arrived.
    TurnResult,
    /// Stop requested, or the process exited.
    Stop,
}

/// Durable description of a session. Also the plain-data view handed out
/// by the command facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub channel_id: String,
    pub name: String,
    pub project_name: String,
    pub project_root: PathBuf,
    pub workspace_path: PathBuf,
    pub branch: String,
    pub resume_token: Option<String>,
    pub state: SessionState,
    pub verbose: bool,
    pub created_at: DateTime<Utc>,
}

/// A permission request awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Live status of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub agent_alive: bool,
    pub pending_permission: Option<PendingPermission>,
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions whose agent was restarted.
    pub resumed: Vec<String>,
    /// Sessions re-registered as stopped because they were already stopped.
    pub stopped: Vec<String>,
    /// Sessions that failed to reattach, with the reason.
    pub failed: Vec<(String, String)>,
    /// Orphan workspaces removed.
    pub orphans_removed: Vec<PathBuf>,
}
