// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the afk daemon.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Config file: `--config`, `$AFK_CONFIG`, or ~/.afk/config.{json,yaml,yml}
//! - Environment: `AFK_DATA_DIR`, `AFK_AGENT`, `AFK_AGENT_PROGRAM`, ...
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > environment > file > defaults).

mod loader;
mod merger;
mod types;

// Re-export public types
pub use loader::{
    default_data_dir, find_config_file, get_global_config_dir, load_config_file,
    load_daemon_config, CONFIG_ENV_VAR, CONFIG_FILES, GLOBAL_CONFIG_DIR,
};

pub use merger::{
    default_config, merge_config, CliOptions, ENV_AGENT_PROGRAM, ENV_AGENT_RUNTIME, ENV_DATA_DIR,
    ENV_MAIN_BRANCH, ENV_PERMISSION_TIMEOUT, ENV_PROJECTS_ROOT,
};

pub use types::{
    AgentCommandConfig, AgentRuntimeKind, CommitMessageMode, DaemonConfig, ResolvedConfig,
    DEFAULT_BRANCH_PREFIX, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_MAIN_BRANCH,
    DEFAULT_STOP_GRACE_SECS, DEFAULT_WORKSPACE_DIR,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources.
///
/// This is the main entry point for configuration loading.
pub fn load_config(
    config_path: Option<&Path>,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let file = load_daemon_config(config_path)?;
    merge_config(file, |key| std::env::var(key).ok(), cli_options)
}
