// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor for stream-json agent CLIs.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentCommandConfig;
use crate::error::AgentError;

use super::protocol::{encode_permission_response, encode_user_message, ResponseStream};
use super::runtime::{AgentLogPaths, AgentProcess, AgentRuntime, AgentSession};

/// Runtime that launches a stream-json CLI (Claude-style by default).
#[derive(Debug, Clone)]
pub struct StreamJsonRuntime {
    command: AgentCommandConfig,
    grace: Duration,
}

impl StreamJsonRuntime {
    pub fn new(command: AgentCommandConfig, grace: Duration) -> Self {
        Self { command, grace }
    }

    /// Full argument list for a start.
    pub fn args_for(&self, resume_token: Option<&str>) -> Vec<String> {
        let mut args = self.command.args.clone();
        if let Some(token) = resume_token {
            args.push(self.command.resume_flag.clone());
            args.push(token.to_string());
        }
        args
    }
}

#[async_trait]
impl AgentRuntime for StreamJsonRuntime {
    async fn start(
        &self,
        working_dir: &Path,
        resume_token: Option<&str>,
        logs: Option<&AgentLogPaths>,
    ) -> Result<AgentSession, AgentError> {
        let args = self.args_for(resume_token);
        info!(
            "Starting agent: {} {} (cwd={:?})",
            self.command.program,
            args.join(" "),
            working_dir
        );

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.command.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.command.env);

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Start(format!("Failed to spawn {}: {}", self.command.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Start("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Start("Failed to get stdout".to_string()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, logs.map(|l| l.stderr.clone()))));

        let mut responses = ResponseStream::new(stdout);
        if let Some(logs) = logs {
            responses = responses.with_raw_log(&logs.raw);
        }

        let process = StreamJsonProcess {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            stderr_task: Mutex::new(stderr_task),
            grace: self.grace,
        };

        Ok(AgentSession {
            process: Box::new(process),
            responses,
        })
    }
}

/// Append the agent's stderr to a log file, or discard it.
pub(super) async fn drain_stderr(stderr: ChildStderr, log_path: Option<std::path::PathBuf>) {
    let mut file = match log_path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot open agent stderr log {:?}: {}", path, e);
                None
            }
        },
        None => None,
    };

    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(f) = file.as_mut() {
                    let written = async {
                        f.write_all(format!("{}\n", line).as_bytes()).await?;
                        f.flush().await
                    }
                    .await;
                    if written.is_err() {
                        file = None;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("stderr drain ended: {}", e);
                break;
            }
        }
    }
}

/// One running stream-json agent process.
pub struct StreamJsonProcess {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl StreamJsonProcess {
    async fn write_line(&self, line: String) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::NotRunning)?;

        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let result = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            // The pipe is unusable from here on
            *guard = None;
            AgentError::Communication(e.to_string())
        })
    }
}

#[async_trait]
impl AgentProcess for StreamJsonProcess {
    async fn send_user_message(&self, text: &str) -> Result<(), AgentError> {
        self.write_line(encode_user_message(text)).await?;
        debug!("Sent to agent: {}", text.chars().take(100).collect::<String>());
        Ok(())
    }

    async fn send_permission_response(&self, request_id: &str, allowed: bool) -> Result<(), AgentError> {
        self.write_line(encode_permission_response(request_id, allowed)).await?;
        debug!("Sent permission response: {} -> {}", request_id, allowed);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        // Closing stdin asks a stream-json CLI to finish
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Agent exited: {}", status),
            Ok(Err(e)) => warn!("Waiting for agent failed: {}", e),
            Err(_) => {
                warn!("Agent did not exit within {:?}, killing", self.grace);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill agent: {}", e);
                }
            }
        }

        if let Some(task) = self.stderr_task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("stderr drain still running after stop");
            }
        }

        info!("Agent process stopped");
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
