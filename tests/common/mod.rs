// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: throwaway git repositories and a scripted agent runtime.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};

use afk::agent::{
    encode_permission_response, encode_user_message, AgentLogPaths, AgentProcess, AgentRuntime,
    AgentSession, ResponseStream,
};
use afk::error::AgentError;
use afk::events::{EventBus, Subscription};
use afk::session::{
    ManagerDeps, ManagerOptions, SessionManager, SessionState, SessionStore,
};
use afk::workspace::{GitWorktreeIsolator, WorkspaceLayout};
use afk::SessionEvent;

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository on `main` with one commit containing README.md.
pub fn init_repo(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "afk@example.com"]);
    git(dir, &["config", "user.name", "afk tests"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "init"]);
    dir.to_path_buf()
}

pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(dir.join(name), content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
}

pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    !git(repo, &["branch", "--list", branch]).is_empty()
}

/// One scripted agent process.
pub struct FakeAgent {
    pub working_dir: PathBuf,
    pub resume_token: Option<String>,
    writer: tokio::sync::Mutex<Option<DuplexStream>>,
    sent: Mutex<Vec<Value>>,
    alive: AtomicBool,
    input_broken: AtomicBool,
}

impl FakeAgent {
    /// Write one protocol line as the agent.
    pub async fn emit(&self, message: Value) {
        self.emit_raw(&message.to_string()).await;
    }

    pub async fn emit_raw(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().expect("agent output still open");
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }

    pub async fn assistant_text(&self, text: &str) {
        self.emit(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        }))
        .await;
    }

    pub async fn tool_use(&self, id: &str, name: &str) {
        self.emit(json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": id, "name": name, "input": {"command": "ls"}}
            ]}
        }))
        .await;
    }

    pub async fn result(&self, cost: f64, duration_ms: u64) {
        self.emit(json!({
            "type": "result",
            "subtype": "success",
            "total_cost_usd": cost,
            "duration_ms": duration_ms,
            "is_error": false,
            "result": "done"
        }))
        .await;
    }

    /// Close the output stream as if the process died.
    pub async fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
    }

    /// Every line the daemon wrote to this agent's stdin.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Make every further write to stdin fail while output stays open.
    pub fn break_input(&self) {
        self.input_broken.store(true, Ordering::SeqCst);
    }

    fn write(&self, line: &str) -> Result<(), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::NotRunning);
        }
        if self.input_broken.load(Ordering::SeqCst) {
            return Err(AgentError::Communication("Broken pipe (os error 32)".to_string()));
        }
        self.sent.lock().unwrap().push(serde_json::from_str(line)?);
        Ok(())
    }
}

struct FakeProcess(Arc<FakeAgent>);

#[async_trait]
impl AgentProcess for FakeProcess {
    async fn send_user_message(&self, text: &str) -> Result<(), AgentError> {
        self.0.write(&encode_user_message(text))
    }

    async fn send_permission_response(&self, request_id: &str, allowed: bool) -> Result<(), AgentError> {
        self.0.write(&encode_permission_response(request_id, allowed))
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.0.exit().await;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

/// Runtime handing out [`FakeAgent`]s. Each start announces `tok-<n>`.
#[derive(Default)]
pub struct FakeRuntime {
    agents: Mutex<Vec<Arc<FakeAgent>>>,
    starts: AtomicUsize,
    fail_starts: AtomicBool,
}

impl FakeRuntime {
    pub fn set_fail(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn agents(&self) -> Vec<Arc<FakeAgent>> {
        self.agents.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakeAgent> {
        self.agents().last().cloned().expect("an agent was started")
    }

    /// The most recent agent started in `working_dir`.
    pub fn agent_in(&self, working_dir: &Path) -> Arc<FakeAgent> {
        self.agents()
            .into_iter()
            .rev()
            .find(|a| a.working_dir == working_dir)
            .expect("an agent was started in that directory")
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn start(
        &self,
        working_dir: &Path,
        resume_token: Option<&str>,
        _logs: Option<&AgentLogPaths>,
    ) -> Result<AgentSession, AgentError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(AgentError::Start("scripted start failure".to_string()));
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let init = json!({"type": "system", "subtype": "init", "session_id": format!("tok-{}", n)});
        writer.write_all(format!("{}\n", init).as_bytes()).await?;

        let agent = Arc::new(FakeAgent {
            working_dir: working_dir.to_path_buf(),
            resume_token: resume_token.map(str::to_string),
            writer: tokio::sync::Mutex::new(Some(writer)),
            sent: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            input_broken: AtomicBool::new(false),
        });
        self.agents.lock().unwrap().push(agent.clone());

        Ok(AgentSession {
            process: Box::new(FakeProcess(agent)),
            responses: ResponseStream::new(reader),
        })
    }
}

/// A project repository, a data dir, and a manager wired to fakes.
pub struct Harness {
    pub temp: TempDir,
    pub project: PathBuf,
    pub data_dir: PathBuf,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<SessionStore>,
    pub bus: EventBus,
    pub manager: SessionManager,
    permission_timeout: Option<Duration>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_permission_timeout(None)
    }

    pub fn with_permission_timeout(permission_timeout: Option<Duration>) -> Self {
        let temp = TempDir::new().unwrap();
        let project = init_repo(&temp.path().join("demo"));
        let data_dir = temp.path().join("data");
        let runtime = Arc::new(FakeRuntime::default());
        let store = Arc::new(SessionStore::open(&data_dir).unwrap());
        let bus = EventBus::new();
        let manager = build_manager(&data_dir, &runtime, &store, &bus, permission_timeout);
        Self {
            temp,
            project,
            data_dir,
            runtime,
            store,
            bus,
            manager,
            permission_timeout,
        }
    }

    /// A second daemon generation over the same disk state and runtime.
    pub fn restart(&self) -> (SessionManager, EventBus) {
        let bus = EventBus::new();
        let manager = build_manager(
            &self.data_dir,
            &self.runtime,
            &self.store,
            &bus,
            self.permission_timeout,
        );
        (manager, bus)
    }

    pub fn isolator(&self) -> GitWorktreeIsolator {
        GitWorktreeIsolator::new(WorkspaceLayout::default(), "main")
    }
}

fn build_manager(
    data_dir: &Path,
    runtime: &Arc<FakeRuntime>,
    store: &Arc<SessionStore>,
    bus: &EventBus,
    permission_timeout: Option<Duration>,
) -> SessionManager {
    let deps = ManagerDeps::new(
        bus.clone(),
        Arc::new(GitWorktreeIsolator::new(WorkspaceLayout::default(), "main")),
        runtime.clone(),
        store.clone(),
    );
    let options = ManagerOptions {
        data_dir: data_dir.to_path_buf(),
        layout: WorkspaceLayout::default(),
        permission_timeout,
    };
    SessionManager::new(deps, options)
}

/// Next event on `sub`, failing the test after five seconds.
pub async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("event arrives in time")
        .expect("subscription open")
}

/// Poll until the session reaches `state`.
pub async fn wait_for_state(manager: &SessionManager, channel_id: &str, state: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.status(channel_id).await.map(|s| s.record.state);
        if current == Some(state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {} stuck in {:?}, wanted {:?}",
            channel_id,
            current,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
