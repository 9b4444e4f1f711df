// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConfigError;

use super::loader::default_data_dir;
use super::types::{
    AgentCommandConfig, AgentRuntimeKind, CommitMessageMode, DaemonConfig, ResolvedConfig,
    DEFAULT_BRANCH_PREFIX, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_MAIN_BRANCH,
    DEFAULT_STOP_GRACE_SECS, DEFAULT_WORKSPACE_DIR,
};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub data_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub main_branch: Option<String>,
    pub agent_runtime: Option<AgentRuntimeKind>,
    pub agent_program: Option<String>,
    pub permission_timeout_secs: Option<u64>,
    pub projects_root: Option<PathBuf>,
}

/// Environment variables consulted during merging.
pub const ENV_DATA_DIR: &str = "AFK_DATA_DIR";
pub const ENV_MAIN_BRANCH: &str = "AFK_MAIN_BRANCH";
pub const ENV_AGENT_RUNTIME: &str = "AFK_AGENT";
pub const ENV_AGENT_PROGRAM: &str = "AFK_AGENT_PROGRAM";
pub const ENV_PERMISSION_TIMEOUT: &str = "AFK_PERMISSION_TIMEOUT_SECS";
pub const ENV_PROJECTS_ROOT: &str = "AFK_PROJECTS_ROOT";

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig {
        data_dir: default_data_dir(),
        log_file: None,
        main_branch: DEFAULT_MAIN_BRANCH.to_string(),
        workspace_dir: DEFAULT_WORKSPACE_DIR.to_string(),
        branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        agent_runtime: AgentRuntimeKind::Claude,
        agent: AgentCommandConfig::default(),
        stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
        permission_timeout_secs: None,
        event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        projects: BTreeMap::new(),
        projects_root: None,
        commit_messages: CommitMessageMode::Static,
    }
}

/// Merge configuration sources with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Environment variables (read through `env`)
/// 3. Config file
/// 4. Default values
pub fn merge_config<F>(
    file: Option<DaemonConfig>,
    env: F,
    cli: CliOptions,
) -> Result<ResolvedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = default_config();

    if let Some(config) = file {
        apply_daemon_config(&mut result, config);
    }

    apply_env(&mut result, &env)?;
    apply_cli_options(&mut result, cli);
    result.agent.fit_to(result.agent_runtime);
    validate(&result)?;

    Ok(result)
}

fn apply_daemon_config(result: &mut ResolvedConfig, config: DaemonConfig) {
    if let Some(data_dir) = config.data_dir {
        result.data_dir = data_dir;
    }
    if config.log_file.is_some() {
        result.log_file = config.log_file;
    }
    if let Some(main_branch) = config.main_branch {
        result.main_branch = main_branch;
    }
    if let Some(workspace_dir) = config.workspace_dir {
        result.workspace_dir = workspace_dir;
    }
    if let Some(branch_prefix) = config.branch_prefix {
        result.branch_prefix = branch_prefix;
    }
    if let Some(kind) = config.agent_runtime {
        result.agent_runtime = kind;
    }
    if let Some(agent) = config.agent {
        result.agent = agent;
    }
    if let Some(grace) = config.stop_grace_secs {
        result.stop_grace_secs = grace;
    }
    if config.permission_timeout_secs.is_some() {
        result.permission_timeout_secs = config.permission_timeout_secs;
    }
    if let Some(capacity) = config.event_queue_capacity {
        result.event_queue_capacity = capacity;
    }
    if let Some(projects) = config.projects {
        result.projects.extend(projects);
    }
    if config.projects_root.is_some() {
        result.projects_root = config.projects_root;
    }
    if let Some(mode) = config.commit_messages {
        result.commit_messages = mode;
    }
}

fn apply_env<F>(result: &mut ResolvedConfig, env: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(dir) = get(ENV_DATA_DIR) {
        result.data_dir = PathBuf::from(dir);
    }
    if let Some(branch) = get(ENV_MAIN_BRANCH) {
        result.main_branch = branch;
    }
    if let Some(kind) = get(ENV_AGENT_RUNTIME) {
        result.agent_runtime = kind.parse().map_err(|message| ConfigError::InvalidValue {
            field: ENV_AGENT_RUNTIME.to_string(),
            message,
        })?;
    }
    if let Some(program) = get(ENV_AGENT_PROGRAM) {
        result.agent.program = program;
    }
    if let Some(timeout) = get(ENV_PERMISSION_TIMEOUT) {
        let secs = timeout.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            field: ENV_PERMISSION_TIMEOUT.to_string(),
            message: e.to_string(),
        })?;
        result.permission_timeout_secs = Some(secs);
    }
    if let Some(root) = get(ENV_PROJECTS_ROOT) {
        result.projects_root = Some(PathBuf::from(root));
    }
    Ok(())
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: CliOptions) {
    if let Some(dir) = cli.data_dir {
        result.data_dir = dir;
    }
    if cli.log_file.is_some() {
        result.log_file = cli.log_file;
    }
    if let Some(branch) = cli.main_branch {
        result.main_branch = branch;
    }
    if let Some(kind) = cli.agent_runtime {
        result.agent_runtime = kind;
    }
    if let Some(program) = cli.agent_program {
        result.agent.program = program;
    }
    if cli.permission_timeout_secs.is_some() {
        result.permission_timeout_secs = cli.permission_timeout_secs;
    }
    if cli.projects_root.is_some() {
        result.projects_root = cli.projects_root;
    }
}

fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    if config.main_branch.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "mainBranch".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if config.workspace_dir.trim().is_empty()
        || config.workspace_dir.contains('/')
        || config.workspace_dir == ".."
    {
        return Err(ConfigError::InvalidValue {
            field: "workspaceDir".to_string(),
            message: "must be a single directory name".to_string(),
        });
    }
    if config.branch_prefix.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "branchPrefix".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if config.event_queue_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "eventQueueCapacity".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.agent.program.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "agent.program".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}
