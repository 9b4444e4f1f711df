// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the on-disk daemon configuration (every field optional, JSON or
//! YAML) and the fully resolved configuration the daemon runs with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Daemon configuration as written in a config file.
/// Can be defined in ~/.afk/config.json or ~/.afk/config.yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Directory for the session database and per-session logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Additional log file (plain text, no ANSI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Main-line branch that sessions fork from and merge into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_branch: Option<String>,

    /// Directory (relative to the project root) holding session workspaces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,

    /// Prefix for session branches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,

    /// Which agent CLI sessions run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_runtime: Option<AgentRuntimeKind>,

    /// Agent command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentCommandConfig>,

    /// Seconds to wait for graceful agent exit before killing it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_grace_secs: Option<u64>,

    /// Auto-deny permission requests left unanswered this long
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_timeout_secs: Option<u64>,

    /// Per-subscriber event queue capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_queue_capacity: Option<usize>,

    /// Registered projects (name -> path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<BTreeMap<String, PathBuf>>,

    /// Directory searched for `<projects_root>/<name>` when a name is not registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_root: Option<PathBuf>,

    /// How commit messages are produced on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_messages: Option<CommitMessageMode>,
}

/// Agent CLI family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRuntimeKind {
    /// Long-lived stream-json process
    #[default]
    Claude,
    /// One `codex exec --json` process per turn
    Codex,
}

impl AgentRuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for AgentRuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => Err(format!("unknown agent runtime: {} (expected claude or codex)", other)),
        }
    }
}

/// Command line used to launch the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommandConfig {
    /// Executable name or path
    #[serde(default = "default_agent_program")]
    pub program: String,

    /// Arguments passed on every start
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,

    /// Flag placed before the resume token on restart
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Environment variables removed before launch
    #[serde(default = "default_env_remove")]
    pub env_remove: Vec<String>,
}

impl AgentCommandConfig {
    /// Defaults for the Codex CLI: `--json --full-auto` on every turn and
    /// `exec resume <thread>` for follow-ups.
    pub fn codex() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec!["--json".to_string(), "--full-auto".to_string()],
            resume_flag: "resume".to_string(),
            env: BTreeMap::new(),
            env_remove: default_env_remove(),
        }
    }

    /// Swap untouched Claude defaults for the ones `kind` needs.
    pub fn fit_to(&mut self, kind: AgentRuntimeKind) {
        if kind != AgentRuntimeKind::Codex {
            return;
        }
        let claude = Self::default();
        let codex = Self::codex();
        if self.program == claude.program {
            self.program = codex.program;
        }
        if self.args == claude.args {
            self.args = codex.args;
        }
        if self.resume_flag == claude.resume_flag {
            self.resume_flag = codex.resume_flag;
        }
    }
}

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    [
        "-p",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_resume_flag() -> String {
    "--resume".to_string()
}

fn default_env_remove() -> Vec<String> {
    // Nested agent invocations refuse to start when this is set
    vec!["CLAUDECODE".to_string()]
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: default_agent_args(),
            resume_flag: default_resume_flag(),
            env: BTreeMap::new(),
            env_remove: default_env_remove(),
        }
    }
}

/// Commit message strategy used when a session is completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMessageMode {
    /// "Session <name> changes"
    #[default]
    Static,
    /// Ask the agent CLI for a one-line summary of the staged diff
    Agent,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub main_branch: String,
    pub workspace_dir: String,
    pub branch_prefix: String,
    pub agent_runtime: AgentRuntimeKind,
    pub agent: AgentCommandConfig,
    pub stop_grace_secs: u64,
    pub permission_timeout_secs: Option<u64>,
    pub event_queue_capacity: usize,
    pub projects: BTreeMap<String, PathBuf>,
    pub projects_root: Option<PathBuf>,
    pub commit_messages: CommitMessageMode,
}

/// Default main-line branch.
pub const DEFAULT_MAIN_BRANCH: &str = "main";

/// Default workspace directory inside each project.
pub const DEFAULT_WORKSPACE_DIR: &str = ".sessions";

/// Default session branch prefix.
pub const DEFAULT_BRANCH_PREFIX: &str = "sess/";

/// Default grace period for agent shutdown.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

/// Default per-subscriber event queue capacity.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
