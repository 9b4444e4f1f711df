// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in the global
//! config directory or an explicitly named path.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::DaemonConfig;

/// Config file names to search for in the global config directory (in order).
pub const CONFIG_FILES: &[&str] = &["config.json", "config.yaml", "config.yml"];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".afk";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "AFK_CONFIG";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Default data directory (~/.afk/data).
pub fn default_data_dir() -> PathBuf {
    get_global_config_dir()
        .unwrap_or_else(|| PathBuf::from(GLOBAL_CONFIG_DIR))
        .join("data")
}

/// Find the config file to load.
///
/// Searches in the following order:
/// 1. The explicit path, if given
/// 2. `$AFK_CONFIG`
/// 3. ~/.afk/config.json, config.yaml, config.yml
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let dir = get_global_config_dir()?;
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Load the daemon configuration.
///
/// A missing explicit file is an error; a missing global file is not.
pub fn load_daemon_config(explicit: Option<&Path>) -> Result<Option<DaemonConfig>, ConfigError> {
    match find_config_file(explicit) {
        Some(path) => {
            if explicit.is_none() && !path.exists() {
                return Ok(None);
            }
            load_config_file(&path).map(Some)
        }
        None => Ok(None),
    }
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}
