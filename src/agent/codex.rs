// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Codex CLI runtime.
//!
//! Codex runs one `codex exec --json` process per turn instead of a
//! long-lived stdin/stdout session. A driver task owns those processes and
//! rewrites their JSONL events into stream-json lines, so sessions read a
//! Codex agent through the same [`ResponseStream`] as any other.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentCommandConfig;
use crate::error::AgentError;

use super::process::drain_stderr;
use super::protocol::{ContentBlock, ResponseStream};
use super::runtime::{AgentLogPaths, AgentProcess, AgentRuntime, AgentSession};

const BRIDGE_CAPACITY: usize = 256 * 1024;

/// Runtime for the Codex CLI in full-auto mode.
///
/// The resume token is the Codex thread id; follow-up turns run
/// `exec resume <thread_id>`.
#[derive(Debug, Clone)]
pub struct CodexRuntime {
    command: AgentCommandConfig,
    grace: Duration,
}

impl CodexRuntime {
    pub fn new(command: AgentCommandConfig, grace: Duration) -> Self {
        Self { command, grace }
    }

    /// Argument list for one turn.
    pub fn turn_args(&self, thread_id: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(id) = thread_id {
            args.push(self.command.resume_flag.clone());
            args.push(id.to_string());
        }
        args.push(prompt.to_string());
        args.extend(self.command.args.iter().cloned());
        args
    }

    fn command_for(&self, working_dir: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.command.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.command.env);
        cmd
    }
}

#[async_trait]
impl AgentRuntime for CodexRuntime {
    async fn start(
        &self,
        working_dir: &Path,
        resume_token: Option<&str>,
        logs: Option<&AgentLogPaths>,
    ) -> Result<AgentSession, AgentError> {
        // Fail early when the binary is missing
        Command::new(&self.command.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                AgentError::Start(format!("Failed to spawn {}: {}", self.command.program, e))
            })?;

        let (mut writer, reader) = tokio::io::duplex(BRIDGE_CAPACITY);
        let mut translator = CodexTranslator::new(resume_token.map(str::to_string));
        if let Some(token) = resume_token {
            write_lines(&mut writer, &[init_line(token)]).await?;
            translator.announced = true;
        }

        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = Driver {
            runtime: self.clone(),
            working_dir: working_dir.to_path_buf(),
            logs: logs.cloned(),
            translator,
            out: writer,
        };
        let handle = tokio::spawn(driver.run(prompt_rx, stop_rx));
        info!("Codex agent ready (cwd={:?})", working_dir);

        let process = CodexProcess {
            prompts: prompt_tx,
            stop: stop_tx,
            driver: Mutex::new(Some(handle)),
            grace: self.grace,
        };
        Ok(AgentSession {
            process: Box::new(process),
            responses: ResponseStream::new(reader),
        })
    }
}

/// Control handle of a Codex session. Prompts queue up and run one turn at
/// a time.
pub struct CodexProcess {
    prompts: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

#[async_trait]
impl AgentProcess for CodexProcess {
    async fn send_user_message(&self, text: &str) -> Result<(), AgentError> {
        if !self.is_alive().await {
            return Err(AgentError::NotRunning);
        }
        self.prompts
            .send(text.to_string())
            .map_err(|_| AgentError::NotRunning)?;
        debug!("Queued Codex turn: {}", text.chars().take(100).collect::<String>());
        Ok(())
    }

    async fn send_permission_response(&self, request_id: &str, allowed: bool) -> Result<(), AgentError> {
        if !self.is_alive().await {
            return Err(AgentError::NotRunning);
        }
        // Full-auto turns never wait for approval
        debug!("Codex ignores permission response: {} -> {}", request_id, allowed);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let _ = self.stop.send(true);
        let Some(handle) = self.driver.lock().await.take() else {
            return Ok(());
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.grace + Duration::from_secs(1), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Codex driver ended abnormally: {}", e),
            Err(_) => {
                warn!("Codex driver did not stop within {:?}, aborting", self.grace);
                abort.abort();
            }
        }
        info!("Codex agent stopped");
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.driver
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

enum TurnEnd {
    Done,
    Stopped,
    Closed,
}

struct Driver {
    runtime: CodexRuntime,
    working_dir: PathBuf,
    logs: Option<AgentLogPaths>,
    translator: CodexTranslator,
    out: DuplexStream,
}

impl Driver {
    async fn run(mut self, mut prompts: mpsc::UnboundedReceiver<String>, mut stop: watch::Receiver<bool>) {
        let mut raw_log = match &self.logs {
            Some(logs) => open_append(&logs.raw).await,
            None => None,
        };

        loop {
            let prompt = tokio::select! {
                biased;
                _ = stop.changed() => break,
                prompt = prompts.recv() => match prompt {
                    Some(prompt) => prompt,
                    None => break,
                },
            };
            match self.turn(&prompt, &mut stop, &mut raw_log).await {
                TurnEnd::Done => {}
                TurnEnd::Stopped | TurnEnd::Closed => break,
            }
        }
        debug!("Codex driver for {:?} finished", self.working_dir);
        // Dropping `out` ends the response stream
    }

    async fn turn(&mut self, prompt: &str, stop: &mut watch::Receiver<bool>, raw_log: &mut Option<File>) -> TurnEnd {
        let args = self.runtime.turn_args(self.translator.thread_id(), prompt);
        info!(
            "Starting Codex turn: {} {} (cwd={:?})",
            self.runtime.command.program,
            args.join(" "),
            self.working_dir
        );
        self.translator.begin_turn();

        let mut child = match self.runtime.command_for(&self.working_dir, &args).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", self.runtime.command.program, e);
                let lines = self
                    .translator
                    .end_turn(Some(format!("failed to start {}: {}", self.runtime.command.program, e)));
                return self.emit(&lines).await;
            }
        };
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(
                stderr,
                self.logs.as_ref().map(|l| l.stderr.clone()),
            ))
        });
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            let lines = self.translator.end_turn(Some("no stdout from codex".to_string()));
            return self.emit(&lines).await;
        };

        let mut lines = BufReader::new(stdout).lines();
        let end = loop {
            let line = tokio::select! {
                biased;
                _ = stop.changed() => break TurnEnd::Stopped,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break TurnEnd::Done,
                Err(e) => {
                    warn!("Reading Codex output failed: {}", e);
                    break TurnEnd::Done;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(file) = raw_log.as_mut() {
                if file.write_all(format!("{}\n", trimmed).as_bytes()).await.is_err() {
                    *raw_log = None;
                }
            }
            let event: Value = match serde_json::from_str(trimmed) {
                Ok(event) => event,
                Err(_) => {
                    warn!("Non-JSON output from Codex: {}", trimmed.chars().take(200).collect::<String>());
                    continue;
                }
            };
            let translated = self.translator.translate(&event);
            if let TurnEnd::Closed = self.emit(&translated).await {
                break TurnEnd::Closed;
            }
        };

        match end {
            TurnEnd::Done => {
                match child.wait().await {
                    Ok(status) => debug!("Codex turn exited: {}", status),
                    Err(e) => warn!("Waiting for Codex failed: {}", e),
                }
                if let Some(task) = stderr_task {
                    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
                }
                let closing = self.translator.end_turn(None);
                self.emit(&closing).await
            }
            other => {
                let _ = child.start_kill();
                match tokio::time::timeout(self.runtime.grace, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => warn!("Codex turn did not exit within {:?}", self.runtime.grace),
                }
                other
            }
        }
    }

    async fn emit(&mut self, lines: &[Value]) -> TurnEnd {
        match write_lines(&mut self.out, lines).await {
            Ok(()) => TurnEnd::Done,
            Err(e) => {
                debug!("Codex response reader gone: {}", e);
                TurnEnd::Closed
            }
        }
    }
}

async fn open_append(path: &Path) -> Option<File> {
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot open raw agent log {:?}: {}", path, e);
            None
        }
    }
}

async fn write_lines(out: &mut DuplexStream, lines: &[Value]) -> Result<(), AgentError> {
    for line in lines {
        out.write_all(format!("{}\n", line).as_bytes()).await?;
    }
    out.flush().await?;
    Ok(())
}

fn init_line(thread_id: &str) -> Value {
    json!({"type": "system", "subtype": "init", "session_id": thread_id})
}

fn error_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "Unknown error".to_string(),
    }
}

/// Rewrites Codex `exec --json` events as stream-json lines.
#[derive(Debug, Default)]
struct CodexTranslator {
    thread_id: Option<String>,
    announced: bool,
    turn_started: Option<Instant>,
    turn_finished: bool,
}

impl CodexTranslator {
    fn new(thread_id: Option<String>) -> Self {
        Self {
            thread_id,
            ..Self::default()
        }
    }

    fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    fn begin_turn(&mut self) {
        self.turn_started = Some(Instant::now());
        self.turn_finished = false;
    }

    fn elapsed_ms(&self) -> u64 {
        self.turn_started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn result_line(&mut self, is_error: bool) -> Value {
        self.turn_finished = true;
        let subtype = if is_error { "error" } else { "success" };
        json!({
            "type": "result",
            "subtype": subtype,
            "total_cost_usd": 0.0,
            "duration_ms": self.elapsed_ms(),
            "is_error": is_error,
        })
    }

    fn translate(&mut self, event: &Value) -> Vec<Value> {
        match event.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                let Some(id) = event.get("thread_id").and_then(Value::as_str) else {
                    return Vec::new();
                };
                if self.announced && self.thread_id.as_deref() == Some(id) {
                    return Vec::new();
                }
                info!("Codex thread: {}", id);
                self.thread_id = Some(id.to_string());
                self.announced = true;
                vec![init_line(id)]
            }
            Some("item.completed") => {
                let blocks = event.get("item").map(map_item).unwrap_or_default();
                if blocks.is_empty() {
                    return Vec::new();
                }
                vec![assistant_line(&blocks)]
            }
            Some("turn.completed") => vec![self.result_line(false)],
            Some("turn.failed") => {
                let text = format!("Error: {}", error_text(event.get("error")));
                vec![assistant_line(&[ContentBlock::Text { text }]), self.result_line(true)]
            }
            Some("error") => {
                let text = format!("Error: {}", error_text(event.get("message")));
                vec![assistant_line(&[ContentBlock::Text { text }])]
            }
            _ => Vec::new(),
        }
    }

    /// Closing lines for a turn whose process is gone. Empty if the turn
    /// already reported its result.
    fn end_turn(&mut self, failure: Option<String>) -> Vec<Value> {
        if self.turn_finished {
            return Vec::new();
        }
        let mut lines = Vec::new();
        if let Some(detail) = failure {
            lines.push(assistant_line(&[ContentBlock::Text {
                text: format!("Error: {}", detail),
            }]));
        }
        lines.push(self.result_line(true));
        lines
    }
}

fn assistant_line(blocks: &[ContentBlock]) -> Value {
    json!({"type": "assistant", "message": {"content": blocks}})
}

/// Content blocks for one completed Codex item. Unknown items map to
/// nothing.
pub fn map_item(item: &Value) -> Vec<ContentBlock> {
    let str_field = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or("");
    let id = item
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("codex-{}", Uuid::new_v4()));
    let tool_use = |name: String, input: Value| ContentBlock::ToolUse {
        id: id.clone(),
        name,
        input,
    };

    match item.get("type").and_then(Value::as_str) {
        Some("agent_message") => {
            let text = str_field("text");
            if text.is_empty() {
                return Vec::new();
            }
            vec![ContentBlock::Text { text: text.to_string() }]
        }
        Some("reasoning") => {
            let text = str_field("text");
            if text.is_empty() {
                return Vec::new();
            }
            vec![ContentBlock::Text {
                text: format!("[reasoning] {}", text),
            }]
        }
        Some("command_execution") => {
            let exit_code = item.get("exit_code").and_then(Value::as_i64).unwrap_or(0);
            vec![
                tool_use("Bash".to_string(), json!({"command": str_field("command")})),
                ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: Value::String(str_field("aggregated_output").to_string()),
                    is_error: exit_code != 0,
                },
            ]
        }
        Some("file_change") => {
            let summary: Vec<String> = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .map(|change| {
                            let kind = change.get("change_kind").and_then(Value::as_str).unwrap_or("modify");
                            let path = change.get("path").and_then(Value::as_str).unwrap_or("unknown");
                            format!("{}: {}", kind, path)
                        })
                        .collect()
                })
                .unwrap_or_default();
            if summary.is_empty() {
                return Vec::new();
            }
            vec![tool_use(
                "FileChange".to_string(),
                json!({"changes": summary.join("\n")}),
            )]
        }
        Some("mcp_tool_call") => {
            let tool_name = item.get("tool_name").and_then(Value::as_str).unwrap_or("mcp_tool");
            let arguments = item.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let mut blocks = vec![tool_use(format!("MCP:{}", tool_name), arguments)];
            match item.get("content") {
                None | Some(Value::Null) => {}
                Some(content) => {
                    let content = match content {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    blocks.push(ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: Value::String(content),
                        is_error: false,
                    });
                }
            }
            blocks
        }
        Some("web_search") => vec![tool_use(
            "WebSearch".to_string(),
            json!({"query": str_field("query")}),
        )],
        Some("error") => {
            let text = item
                .get("text")
                .or_else(|| item.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            vec![ContentBlock::Text {
                text: format!("Error: {}", text),
            }]
        }
        _ => Vec::new(),
    }
}
