// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Commit message providers used when a session is completed.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{AgentCommandConfig, AgentRuntimeKind, CommitMessageMode};

/// Message used whenever a generated one is unavailable.
pub const FALLBACK_COMMIT_MESSAGE: &str = "Update files";

/// Maximum commit subject length.
pub const MAX_SUBJECT_LEN: usize = 72;

/// Produces the message for the commit of a session's pending changes.
///
/// Called after the changes are staged, so `git diff --cached` in
/// `workspace_path` shows what will be committed.
#[async_trait]
pub trait CommitMessageProvider: Send + Sync {
    async fn message(&self, workspace_path: &Path, label: &str) -> String;
}

/// "Session <label> changes".
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCommitMessage;

#[async_trait]
impl CommitMessageProvider for StaticCommitMessage {
    async fn message(&self, _workspace_path: &Path, label: &str) -> String {
        format!("Session {} changes", label)
    }
}

/// Asks the agent CLI for a one-line summary of the staged diff.
#[derive(Debug, Clone)]
pub struct AgentCommitMessage {
    program: String,
    args: Vec<String>,
    env_remove: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl AgentCommitMessage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-p".to_string(), "--no-session-persistence".to_string()],
            env_remove: Vec::new(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Build from the agent command configuration (program and environment).
    pub fn from_config(agent: &AgentCommandConfig, kind: AgentRuntimeKind) -> Self {
        let mut provider = Self::new(agent.program.clone());
        if kind == AgentRuntimeKind::Codex {
            provider.args = vec!["exec".to_string()];
        }
        provider.env_remove = agent.env_remove.clone();
        provider.env = agent.env.clone();
        provider
    }

    /// Arguments placed before the prompt.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn staged_stat(workspace_path: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["diff", "--cached", "--stat"])
            .current_dir(workspace_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        let stat = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !stat.is_empty()).then_some(stat)
    }

    async fn generate(&self, workspace_path: &Path, stat: &str) -> Option<String> {
        let prompt = format!(
            "Based on the following git diff stat, write a concise commit message \
             (single line, max {} chars, imperative mood, no quotes). \
             Just output the message, nothing else.\n\n{}",
            MAX_SUBJECT_LEN, stat
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .current_dir(workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.env);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Commit message generation failed to start: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Commit message generation timed out after {:?}", self.timeout);
                return None;
            }
        };

        if !output.status.success() {
            warn!("Commit message generation exited with {}", output.status);
            return None;
        }
        summarize(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl CommitMessageProvider for AgentCommitMessage {
    async fn message(&self, workspace_path: &Path, _label: &str) -> String {
        let Some(stat) = Self::staged_stat(workspace_path).await else {
            return FALLBACK_COMMIT_MESSAGE.to_string();
        };
        match self.generate(workspace_path, &stat).await {
            Some(message) => {
                debug!("Generated commit message: {}", message);
                message
            }
            None => FALLBACK_COMMIT_MESSAGE.to_string(),
        }
    }
}

/// First non-empty line, unquoted, capped at [`MAX_SUBJECT_LEN`] characters.
pub fn summarize(output: &str) -> Option<String> {
    let line = output
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '"' || c == '\''))
        .find(|l| !l.is_empty())?;
    Some(line.chars().take(MAX_SUBJECT_LEN).collect())
}

/// Provider selected by configuration.
pub fn provider_for(
    mode: CommitMessageMode,
    kind: AgentRuntimeKind,
    agent: &AgentCommandConfig,
) -> Box<dyn CommitMessageProvider> {
    match mode {
        CommitMessageMode::Static => Box::new(StaticCommitMessage),
        CommitMessageMode::Agent => Box::new(AgentCommitMessage::from_config(agent, kind)),
    }
}
