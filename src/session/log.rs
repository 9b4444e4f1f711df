// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session log files under `<data_dir>/logs/<session-name>/`.
//!
//! - `session.log`: timestamped lifecycle lines
//! - `agent.raw.log`: every raw protocol line read from the agent
//! - `agent.stderr.log`: the agent's stderr
//!
//! Files are opened in append mode and outlive the workspace.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use crate::agent::AgentLogPaths;

/// Lifecycle log of one session.
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    file: Mutex<Option<File>>,
}

impl SessionLog {
    /// Open (or reopen after recovery) the log directory of `session_name`.
    pub fn open(data_dir: &Path, session_name: &str) -> io::Result<Self> {
        let dir = data_dir.join("logs").join(session_name);
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("session.log"))?;
        Ok(Self {
            dir,
            file: Mutex::new(Some(file)),
        })
    }

    /// A log that discards everything (used when the directory is unusable).
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    /// Open, falling back to [`disabled`](Self::disabled) with a warning.
    pub fn open_or_disabled(data_dir: &Path, session_name: &str) -> Self {
        Self::open(data_dir, session_name).unwrap_or_else(|e| {
            warn!("Session log for {} unavailable: {}", session_name, e);
            Self::disabled()
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Raw and stderr paths for the agent, if logging is enabled.
    pub fn agent_paths(&self) -> Option<AgentLogPaths> {
        if self.dir.as_os_str().is_empty() {
            return None;
        }
        Some(AgentLogPaths {
            raw: self.dir.join("agent.raw.log"),
            stderr: self.dir.join("agent.stderr.log"),
        })
    }

    pub fn info(&self, message: &str) {
        self.write("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.write("WARN", message);
    }

    fn write(&self, level: &str, message: &str) {
        let mut guard = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} {}: {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                message
            );
            if file.write_all(line.as_bytes()).is_err() {
                *guard = None;
            }
        }
    }

    /// Close the file. Later writes are dropped.
    pub fn close(&self) {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
