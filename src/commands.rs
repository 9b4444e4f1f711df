// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command facade.
//!
//! The only surface a control-plane adapter (chat bot, dashboard, CLI)
//! talks to. Every method validates its request, calls the session
//! manager and returns plain data or a [`CommandRejection`] with a
//! human-readable reason.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::SessionError;
use crate::projects::ProjectLookup;
use crate::session::{RecoveryReport, SessionManager, SessionRecord, SessionState, SessionStatus};

static PROJECT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Why a command was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRejection {
    pub reason: String,
}

impl CommandRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for CommandRejection {}

impl From<SessionError> for CommandRejection {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Workspace(ref e) => match e.conflict_summary() {
                Some(summary) => Self::new(summary),
                None => Self::new(err.to_string()),
            },
            other => Self::new(other.to_string()),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandRejection>;

/// Facade over the session manager.
#[derive(Clone)]
pub struct Commands {
    manager: SessionManager,
    projects: Arc<dyn ProjectLookup>,
}

impl Commands {
    pub fn new(manager: SessionManager, projects: Arc<dyn ProjectLookup>) -> Self {
        Self { manager, projects }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Start a session on `project_name`.
    ///
    /// Without a `channel_id` a fresh one is generated; the control plane
    /// reads it back from the returned record.
    pub async fn create_session(
        &self,
        project_name: &str,
        channel_id: Option<&str>,
        verbose: bool,
    ) -> CommandResult<SessionRecord> {
        let project_name = project_name.trim();
        if !PROJECT_NAME.is_match(project_name) {
            return Err(CommandRejection::new(format!(
                "invalid project name: {:?}",
                project_name
            )));
        }
        let root = self
            .projects
            .resolve(project_name)
            .ok_or_else(|| CommandRejection::from(SessionError::ProjectNotFound(project_name.to_string())))?;

        let channel_id = match channel_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CommandRejection::new("channel id must not be empty"));
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let record = self
            .manager
            .create_session(&channel_id, project_name, &root, verbose)
            .await?;
        info!("Command create: {} -> {}", project_name, record.name);
        Ok(record)
    }

    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        self.manager.list_sessions().await
    }

    pub async fn get_session(&self, channel_id: &str) -> CommandResult<SessionStatus> {
        self.manager
            .status(channel_id)
            .await
            .ok_or_else(|| SessionError::NotFound(channel_id.to_string()).into())
    }

    /// Status of a session, as shown to the operator.
    pub async fn status(&self, channel_id: &str) -> CommandResult<SessionStatus> {
        self.get_session(channel_id).await
    }

    /// Discard a session and its work.
    pub async fn stop_session(&self, channel_id: &str) -> CommandResult<()> {
        if self.manager.status(channel_id).await.is_none() {
            return Err(SessionError::NotFound(channel_id.to_string()).into());
        }
        if self.manager.stop_session(channel_id).await {
            Ok(())
        } else {
            Err(CommandRejection::new("stop failed; see session log"))
        }
    }

    /// Merge a session's work into main. Returns `"merged"` on success.
    pub async fn complete_session(&self, channel_id: &str) -> CommandResult<String> {
        Ok(self.manager.complete_session(channel_id).await?)
    }

    /// Restart the agent of a stopped session.
    pub async fn resume_session(&self, channel_id: &str) -> CommandResult<SessionRecord> {
        Ok(self.manager.resume_session(channel_id).await?)
    }

    /// Forward a user message.
    pub async fn send_message(&self, channel_id: &str, text: &str) -> CommandResult<()> {
        if text.trim().is_empty() {
            return Err(CommandRejection::new("message is empty"));
        }
        let status = self
            .manager
            .status(channel_id)
            .await
            .ok_or_else(|| CommandRejection::from(SessionError::NotFound(channel_id.to_string())))?;

        match status.record.state {
            SessionState::Stopped => {
                return Err(CommandRejection::new("session is stopped"));
            }
            SessionState::WaitingPermission => {
                return Err(CommandRejection::new("waiting for permission approval"));
            }
            SessionState::Idle | SessionState::Running => {}
        }

        if self.manager.send_to_session(channel_id, text).await {
            Ok(())
        } else {
            Err(CommandRejection::new("agent is not running"))
        }
    }

    /// Forward a voice message already transcribed by the speech engine.
    pub async fn send_voice_transcript(&self, channel_id: &str, transcript: &str) -> CommandResult<()> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(CommandRejection::new("transcription was empty"));
        }
        self.send_message(channel_id, transcript).await
    }

    /// Answer a pending permission request.
    pub async fn respond_permission(
        &self,
        channel_id: &str,
        request_id: &str,
        allowed: bool,
    ) -> CommandResult<()> {
        if self
            .manager
            .respond_to_permission(channel_id, request_id, allowed)
            .await
        {
            Ok(())
        } else {
            Err(CommandRejection::new("no matching permission request is pending"))
        }
    }

    /// Recover persisted sessions against the configured projects.
    pub async fn recover(&self, records: Vec<SessionRecord>) -> RecoveryReport {
        self.manager
            .recover_on_startup(records, self.projects.as_ref())
            .await
    }
}
