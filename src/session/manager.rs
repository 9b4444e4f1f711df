// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session orchestrator.
//!
//! Sole owner of the live session registry and sole driver of each
//! session's lifecycle. Mutations of one channel (create, stop, complete,
//! resume, suspend) are serialized by a per-channel lock; different
//! channels proceed independently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Local, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentProcess, AgentRuntime, AgentSession, ResponseStream};
use crate::config::ResolvedConfig;
use crate::error::{AgentError, SessionError, WorkspaceError};
use crate::events::{EventBus, SessionEvent, StopReason};
use crate::projects::ProjectLookup;
use crate::workspace::{
    base_session_name, CommitMessageProvider, NameAllocator, StaticCommitMessage,
    WorkspaceIsolator, WorkspaceLayout,
};
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::hooks::{CleanupHook, CleanupHooks};
use super::log::SessionLog;
use super::store::SessionStore;
use super::types::{
    PendingPermission, RecoveryReport, SessionRecord, SessionState, SessionStatus, Transition,
};

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Root for per-session logs.
    pub data_dir: PathBuf,
    pub layout: WorkspaceLayout,
    /// Auto-deny permission requests left unanswered this long.
    pub permission_timeout: Option<Duration>,
}

impl ManagerOptions {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            layout: WorkspaceLayout::new(&config.workspace_dir, &config.branch_prefix),
            permission_timeout: config.permission_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Collaborators injected into the orchestrator.
pub struct ManagerDeps {
    pub bus: EventBus,
    pub isolator: Arc<dyn WorkspaceIsolator>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub store: Arc<SessionStore>,
    pub commit_messages: Arc<dyn CommitMessageProvider>,
}

impl ManagerDeps {
    pub fn new(
        bus: EventBus,
        isolator: Arc<dyn WorkspaceIsolator>,
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            bus,
            isolator,
            runtime,
            store,
            commit_messages: Arc::new(StaticCommitMessage),
        }
    }

    pub fn with_commit_messages(mut self, provider: Arc<dyn CommitMessageProvider>) -> Self {
        self.commit_messages = provider;
        self
    }
}

/// Mutable part of a session.
#[derive(Debug)]
pub(super) struct LiveStatus {
    pub state: SessionState,
    pub resume_token: Option<String>,
    pub pending_permission: Option<PendingPermission>,
    /// Bumped on every agent (re)start; stale read loops compare against it.
    pub generation: u64,
}

/// The live agent of a session.
#[derive(Default)]
pub(super) struct AgentSlot {
    pub process: Option<Arc<dyn AgentProcess>>,
    pub read_loop: Option<JoinHandle<()>>,
    pub cancel: Option<oneshot::Sender<()>>,
}

/// One registered session.
pub(super) struct SessionEntry {
    pub channel_id: String,
    pub name: String,
    pub project_name: String,
    pub project_root: PathBuf,
    pub workspace_path: PathBuf,
    pub branch: String,
    pub verbose: bool,
    pub created_at: DateTime<Utc>,
    pub log: SessionLog,
    status: Mutex<LiveStatus>,
    slot: tokio::sync::Mutex<AgentSlot>,
}

impl SessionEntry {
    pub fn status(&self) -> MutexGuard<'_, LiveStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Apply a state machine input, returning the new state.
    pub fn transition(&self, transition: Transition) -> SessionState {
        let mut status = self.status();
        status.state = status.state.apply(transition);
        status.state
    }

    pub fn record(&self) -> SessionRecord {
        let status = self.status();
        SessionRecord {
            channel_id: self.channel_id.clone(),
            name: self.name.clone(),
            project_name: self.project_name.clone(),
            project_root: self.project_root.clone(),
            workspace_path: self.workspace_path.clone(),
            branch: self.branch.clone(),
            resume_token: status.resume_token.clone(),
            state: status.state,
            verbose: self.verbose,
            created_at: self.created_at,
        }
    }

    pub async fn process(&self) -> Option<Arc<dyn AgentProcess>> {
        self.slot.lock().await.process.clone()
    }
}

pub(super) struct Inner {
    pub bus: EventBus,
    pub isolator: Arc<dyn WorkspaceIsolator>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub store: Arc<SessionStore>,
    pub commit_messages: Arc<dyn CommitMessageProvider>,
    pub hooks: CleanupHooks,
    pub options: ManagerOptions,
    names: NameAllocator,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    channel_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    fn get(&self, channel_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(channel_id)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<SessionEntry>> {
        let mut entries: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        entries
    }

    fn register(&self, entry: Arc<SessionEntry>) {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entry.channel_id.clone(), entry);
    }

    fn unregister(&self, channel_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(channel_id);
    }

    fn channel_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.channel_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }

    /// Write the session's current record. Failures are logged.
    pub fn persist(&self, entry: &SessionEntry) {
        if let Err(e) = self.store.upsert(&entry.record()) {
            error!("Failed to persist session {}: {}", entry.name, e);
        }
    }

    /// Start an agent for `entry`, resuming with its token if it has one.
    ///
    /// The returned stream is not read until [`spawn_read_loop`](Self::spawn_read_loop).
    async fn start_agent(&self, entry: &SessionEntry) -> Result<ResponseStream, SessionError> {
        let token = entry.status().resume_token.clone();
        if token.is_none() {
            debug!("Starting {} without resume token", entry.name);
        }
        let logs = entry.log.agent_paths();
        let AgentSession { process, responses } = self
            .runtime
            .start(&entry.workspace_path, token.as_deref(), logs.as_ref())
            .await?;

        {
            let mut status = entry.status();
            status.generation += 1;
            status.state = SessionState::Idle;
            status.pending_permission = None;
        }
        entry.slot.lock().await.process = Some(Arc::from(process));
        Ok(responses)
    }

    async fn spawn_read_loop(self: &Arc<Self>, entry: &Arc<SessionEntry>, responses: ResponseStream) {
        let generation = entry.status().generation;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut slot = entry.slot.lock().await;
        slot.cancel = Some(cancel_tx);
        slot.read_loop = Some(tokio::spawn(super::read_loop::run(
            Arc::downgrade(self),
            entry.clone(),
            responses,
            cancel_rx,
            generation,
        )));
    }

    async fn rollback_workspace(&self, entry: &SessionEntry, reason: &str) {
        warn!("Rolling back session {}: {}", entry.name, reason);
        entry.log.warn(&format!("Session creation failed: {}", reason));
        if let Err(e) = self
            .isolator
            .destroy(&entry.project_root, &entry.workspace_path, &entry.branch)
            .await
        {
            error!("Rollback of workspace {:?} failed: {}", entry.workspace_path, e);
        }
    }

    /// Stop the read loop, run cleanup hooks, then stop the process.
    ///
    /// Publishes `AgentStopped(reason)` unless the session had already
    /// stopped on its own.
    async fn teardown_agent(&self, entry: &SessionEntry, reason: StopReason, run_hooks: bool) {
        let was_stopped = {
            let mut status = entry.status();
            let was = status.state.is_stopped();
            status.state = SessionState::Stopped;
            status.pending_permission = None;
            was
        };

        let (cancel, read_loop) = {
            let mut slot = entry.slot.lock().await;
            (slot.cancel.take(), slot.read_loop.take())
        };
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        if let Some(handle) = read_loop {
            if let Err(e) = handle.await {
                warn!("Read loop for {} ended abnormally: {}", entry.name, e);
            }
        }

        if run_hooks {
            self.hooks.run(&entry.channel_id).await;
        }

        let process = entry.slot.lock().await.process.take();
        if let Some(process) = process {
            if let Err(e) = process.stop().await {
                warn!("Failed to stop agent for {}: {}", entry.name, e);
            }
        }

        if !was_stopped {
            self.persist(entry);
            self.bus.publish(SessionEvent::AgentStopped {
                channel_id: entry.channel_id.clone(),
                session_name: entry.name.clone(),
                reason,
            });
        }
    }

    /// Stop a session whose agent input broke while writing to it.
    ///
    /// Does nothing if the agent of `generation` was already replaced or
    /// the session stopped by other means.
    pub(super) async fn fail_agent(&self, entry: &SessionEntry, generation: u64, detail: String) {
        let lock = self.channel_lock(&entry.channel_id);
        let _guard = lock.lock().await;

        {
            let status = entry.status();
            if status.generation != generation || status.state.is_stopped() {
                return;
            }
        }

        warn!("Agent input for {} broke: {}", entry.name, detail);
        entry.log.warn(&format!("Agent communication error: {}", detail));
        self.teardown_agent(entry, StopReason::CommunicationError(detail), true)
            .await;
    }

    /// Remove the session everywhere. Only called once its workspace is gone.
    fn forget(&self, entry: &SessionEntry) {
        self.unregister(&entry.channel_id);
        if let Err(e) = self.store.remove(&entry.channel_id) {
            error!("Failed to remove persisted session {}: {}", entry.name, e);
        }
    }
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(deps: ManagerDeps, options: ManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: deps.bus,
                isolator: deps.isolator,
                runtime: deps.runtime,
                store: deps.store,
                commit_messages: deps.commit_messages,
                hooks: CleanupHooks::new(),
                options,
                names: NameAllocator::new(),
                sessions: RwLock::new(HashMap::new()),
                channel_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Register a teardown hook run, in registration order, on stop and
    /// completion before the agent process is stopped.
    pub fn add_cleanup_hook(&self, hook: Arc<dyn CleanupHook>) {
        self.inner.hooks.add(hook);
    }

    /// Create a workspace and agent for a new session bound to `channel_id`.
    ///
    /// Any failure rolls back completely: nothing stays registered,
    /// persisted, or on disk.
    pub async fn create_session(
        &self,
        channel_id: &str,
        project_name: &str,
        project_root: &Path,
        verbose: bool,
    ) -> Result<SessionRecord, SessionError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let inner = &self.inner;
        let lock = inner.channel_lock(channel_id);
        let _guard = lock.lock().await;

        if inner.get(channel_id).is_some() {
            return Err(SessionError::AlreadyExists(channel_id.to_string()));
        }

        let layout = &inner.options.layout;
        let registered: HashSet<String> = inner.all().iter().map(|e| e.name.clone()).collect();
        let name = inner.names.allocate(
            &base_session_name(project_name, Local::now()),
            |candidate| registered.contains(candidate),
        );
        let workspace_path = layout.workspace_path(project_root, &name);
        let branch = layout.branch_name(&name);

        if workspace_path.exists() {
            warn!("Workspace path already exists, cleaning up: {:?}", workspace_path);
            if let Err(e) = inner.isolator.destroy(project_root, &workspace_path, &branch).await {
                warn!("Stale workspace cleanup failed: {}", e);
            }
            if workspace_path.exists() {
                std::fs::remove_dir_all(&workspace_path).map_err(WorkspaceError::from)?;
            }
        }

        inner.isolator.create(project_root, &workspace_path, &branch).await?;

        let log = SessionLog::open_or_disabled(&inner.options.data_dir, &name);
        log.info(&format!(
            "Session created: project={} workspace={}",
            project_name,
            workspace_path.display()
        ));

        let entry = Arc::new(SessionEntry {
            channel_id: channel_id.to_string(),
            name: name.clone(),
            project_name: project_name.to_string(),
            project_root: project_root.to_path_buf(),
            workspace_path: workspace_path.clone(),
            branch: branch.clone(),
            verbose,
            created_at: Utc::now(),
            log,
            status: Mutex::new(LiveStatus {
                state: SessionState::Idle,
                resume_token: None,
                pending_permission: None,
                generation: 0,
            }),
            slot: tokio::sync::Mutex::new(AgentSlot::default()),
        });

        if let Err(e) = inner.store.upsert(&entry.record()) {
            inner.rollback_workspace(&entry, &e.to_string()).await;
            return Err(e.into());
        }

        let responses = match inner.start_agent(&entry).await {
            Ok(responses) => responses,
            Err(e) => {
                if let Err(store_err) = inner.store.remove(channel_id) {
                    error!("Failed to remove record of {}: {}", name, store_err);
                }
                inner.rollback_workspace(&entry, &e.to_string()).await;
                return Err(e);
            }
        };

        // SessionCreated goes out before the read loop can publish anything
        inner.register(entry.clone());
        inner.bus.publish(SessionEvent::SessionCreated {
            channel_id: channel_id.to_string(),
            name: entry.name.clone(),
            project_name: project_name.to_string(),
            project_root: project_root.display().to_string(),
            workspace_path: entry.workspace_path.display().to_string(),
            verbose,
        });
        inner.spawn_read_loop(&entry, responses).await;

        info!(
            "Created session: {} (channel={}, workspace={:?})",
            entry.name, channel_id, entry.workspace_path
        );

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.create", start.elapsed());

        Ok(entry.record())
    }

    /// Forward a user message. `false` if the session is unknown, stopped,
    /// or its process is not alive.
    ///
    /// A broken agent input stops the session.
    pub async fn send_to_session(&self, channel_id: &str, text: &str) -> bool {
        let Some(entry) = self.inner.get(channel_id) else {
            return false;
        };
        if entry.state().is_stopped() {
            return false;
        }
        let Some(process) = entry.process().await else {
            return false;
        };
        if !process.is_alive().await {
            return false;
        }

        let generation = entry.status().generation;
        match process.send_user_message(text).await {
            Ok(()) => {
                entry.transition(Transition::UserMessage);
                true
            }
            Err(AgentError::Communication(detail)) => {
                self.inner.fail_agent(&entry, generation, detail).await;
                false
            }
            Err(e) => {
                warn!("Send to {} failed: {}", entry.name, e);
                false
            }
        }
    }

    /// Forward a permission decision.
    ///
    /// `false` unless the session is waiting for permission (and, when the
    /// pending request is known, `request_id` matches it). A failed write
    /// leaves the request pending.
    pub async fn respond_to_permission(&self, channel_id: &str, request_id: &str, allowed: bool) -> bool {
        let Some(entry) = self.inner.get(channel_id) else {
            return false;
        };
        let Some(process) = entry.process().await else {
            return false;
        };

        let generation = {
            let status = entry.status();
            if status.state != SessionState::WaitingPermission {
                warn!(
                    "Permission response for {} ignored: session is {}",
                    entry.name, status.state
                );
                return false;
            }
            if let Some(pending) = &status.pending_permission {
                if pending.request_id != request_id {
                    warn!(
                        "Permission response for {} ignored: expected {}, got {}",
                        entry.name, pending.request_id, request_id
                    );
                    return false;
                }
            }
            status.generation
        };

        match process.send_permission_response(request_id, allowed).await {
            Ok(()) => {
                {
                    let mut status = entry.status();
                    let answered = status.generation == generation
                        && status
                            .pending_permission
                            .as_ref()
                            .map_or(true, |p| p.request_id == request_id);
                    if answered {
                        status.state = status.state.apply(Transition::PermissionAnswered);
                        status.pending_permission = None;
                    }
                }
                entry.log.info(&format!(
                    "Permission {}: id={}",
                    if allowed { "allowed" } else { "denied" },
                    request_id
                ));
                true
            }
            Err(AgentError::Communication(detail)) => {
                self.inner.fail_agent(&entry, generation, detail).await;
                false
            }
            Err(e) => {
                warn!("Permission response to {} failed: {}", entry.name, e);
                false
            }
        }
    }

    /// Discard a session: stop the agent, delete workspace and branch,
    /// forget the session.
    pub async fn stop_session(&self, channel_id: &str) -> bool {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let inner = &self.inner;
        let lock = inner.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let Some(entry) = inner.get(channel_id) else {
            return false;
        };

        inner.teardown_agent(&entry, StopReason::Requested, true).await;

        if let Err(e) = inner
            .isolator
            .destroy(&entry.project_root, &entry.workspace_path, &entry.branch)
            .await
        {
            error!("Failed to remove workspace of {}: {}", entry.name, e);
            entry.log.warn(&format!("Stop incomplete, workspace not removed: {}", e));
            inner.persist(&entry);
            return false;
        }

        inner.forget(&entry);
        entry.log.info("Session stopped by user");
        entry.log.close();
        info!("Stopped session: {}", entry.name);

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.stop", start.elapsed());

        true
    }

    /// Commit, merge into main, then discard the session.
    ///
    /// On a merge conflict the session stays registered as `stopped` with
    /// its workspace and branch intact, and the conflict is returned.
    pub async fn complete_session(&self, channel_id: &str) -> Result<String, SessionError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let inner = &self.inner;
        let lock = inner.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let entry = inner
            .get(channel_id)
            .ok_or_else(|| SessionError::NotFound(channel_id.to_string()))?;

        inner.teardown_agent(&entry, StopReason::Completed, true).await;
        inner.persist(&entry);

        inner
            .isolator
            .commit_pending_changes(&entry.workspace_path, &entry.name, inner.commit_messages.as_ref())
            .await
            .inspect_err(|e| entry.log.warn(&format!("Commit failed: {}", e)))?;

        if let Err(e) = inner
            .isolator
            .merge_to_main(&entry.project_root, &entry.branch, &entry.workspace_path)
            .await
        {
            let summary = e.conflict_summary().unwrap_or_else(|| e.to_string());
            entry.log.warn(&format!("Merge failed, workspace kept: {}", summary));
            warn!("Completion of {} failed: {}", entry.name, summary);
            return Err(e.into());
        }

        inner
            .isolator
            .destroy(&entry.project_root, &entry.workspace_path, &entry.branch)
            .await
            .inspect_err(|e| entry.log.warn(&format!("Merged, but cleanup failed: {}", e)))?;

        inner.forget(&entry);
        entry.log.info("Session completed (merged into main)");
        entry.log.close();
        info!("Completed session: {} (merged into main)", entry.name);

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.complete", start.elapsed());

        Ok("merged".to_string())
    }

    /// Restart the agent of a stopped session whose workspace is intact.
    pub async fn resume_session(&self, channel_id: &str) -> Result<SessionRecord, SessionError> {
        let inner = &self.inner;
        let lock = inner.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let entry = inner
            .get(channel_id)
            .ok_or_else(|| SessionError::NotFound(channel_id.to_string()))?;

        if !entry.state().is_stopped() {
            return Err(SessionError::InvalidState(format!(
                "session {} is {}, not stopped",
                entry.name,
                entry.state()
            )));
        }
        if !entry.workspace_path.is_dir() {
            return Err(SessionError::InvalidState(format!(
                "workspace {} no longer exists",
                entry.workspace_path.display()
            )));
        }

        // The previous handle must be gone before a new one exists
        inner.teardown_agent(&entry, StopReason::Requested, false).await;

        let responses = inner.start_agent(&entry).await.inspect_err(|e| {
            entry.status().state = SessionState::Stopped;
            entry.log.warn(&format!("Resume failed: {}", e));
        })?;
        inner.spawn_read_loop(&entry, responses).await;
        inner.persist(&entry);
        entry.log.info("Session resumed");
        info!("Resumed session: {}", entry.name);
        Ok(entry.record())
    }

    /// Re-attach persisted sessions, then remove orphan workspaces.
    ///
    /// Records that cannot be reattached are registered as `stopped` and
    /// reported; startup always continues.
    pub async fn recover_on_startup(
        &self,
        records: Vec<SessionRecord>,
        projects: &dyn ProjectLookup,
    ) -> RecoveryReport {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let inner = &self.inner;
        let mut report = RecoveryReport::default();
        let mut roots: Vec<PathBuf> = projects.all().into_iter().map(|(_, path)| path).collect();

        for record in records {
            if !roots.contains(&record.project_root) {
                roots.push(record.project_root.clone());
            }
            let channel_id = record.channel_id.clone();
            let lock = inner.channel_lock(&channel_id);
            let _guard = lock.lock().await;

            if inner.get(&channel_id).is_some() {
                debug!("Session {} already registered, skipping recovery", record.name);
                continue;
            }
            inner.names.reserve(&record.name);

            let log = SessionLog::open_or_disabled(&inner.options.data_dir, &record.name);
            let entry = Arc::new(SessionEntry {
                channel_id: record.channel_id.clone(),
                name: record.name.clone(),
                project_name: record.project_name.clone(),
                project_root: record.project_root.clone(),
                workspace_path: record.workspace_path.clone(),
                branch: record.branch.clone(),
                verbose: record.verbose,
                created_at: record.created_at,
                log,
                status: Mutex::new(LiveStatus {
                    state: SessionState::Stopped,
                    resume_token: record.resume_token.clone(),
                    pending_permission: None,
                    generation: 0,
                }),
                slot: tokio::sync::Mutex::new(AgentSlot::default()),
            });
            inner.register(entry.clone());

            if record.state.is_stopped() {
                entry.log.info("Session restored as stopped");
                report.stopped.push(record.name.clone());
                continue;
            }

            let outcome = if let Err(reason) = check_project(&record, projects) {
                Err(SessionError::Recovery {
                    channel_id: channel_id.clone(),
                    reason,
                })
            } else if !record.workspace_path.is_dir() {
                Err(SessionError::Recovery {
                    channel_id: channel_id.clone(),
                    reason: format!("workspace missing: {}", record.workspace_path.display()),
                })
            } else {
                if record.resume_token.is_none() {
                    warn!("No resume token for {}, starting a fresh agent", record.name);
                }
                inner.start_agent(&entry).await
            };

            match outcome {
                Ok(responses) => {
                    inner.spawn_read_loop(&entry, responses).await;
                    entry.log.info("Session recovered from previous run");
                    info!("Recovered session: {} (channel={})", record.name, channel_id);
                    report.resumed.push(record.name.clone());
                }
                Err(e) => {
                    let reason = match e {
                        SessionError::Recovery { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    entry.status().state = SessionState::Stopped;
                    entry.log.warn(&format!("Recovery failed: {}", reason));
                    error!("Failed to recover session {}: {}", record.name, reason);
                    report.failed.push((record.name.clone(), reason));
                }
            }
            inner.persist(&entry);
        }

        report.orphans_removed = self.reconcile_orphans(&roots).await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.recover", start.elapsed());

        report
    }

    /// Destroy managed workspaces under `roots` not referenced by any
    /// registered session.
    pub async fn reconcile_orphans(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let inner = &self.inner;
        let referenced: HashSet<PathBuf> = inner
            .all()
            .iter()
            .map(|e| canonical(&e.workspace_path))
            .collect();

        let mut seen = HashSet::new();
        let mut removed = Vec::new();
        for root in roots {
            if !seen.insert(canonical(root)) {
                continue;
            }
            let workspaces = match inner.isolator.list_managed_workspaces(root).await {
                Ok(list) => list,
                Err(e) => {
                    warn!("Failed to list workspaces of {:?}: {}", root, e);
                    continue;
                }
            };

            for ws in workspaces {
                if referenced.contains(&canonical(&ws.path)) {
                    info!("Keeping recovered workspace: {:?} (branch={})", ws.path, ws.branch);
                    continue;
                }
                warn!("Orphan workspace detected: {:?} (branch={}), removing", ws.path, ws.branch);
                match inner.isolator.destroy(root, &ws.path, &ws.branch).await {
                    Ok(()) => removed.push(ws.path),
                    Err(e) => error!("Failed to remove orphan {:?}: {}", ws.path, e),
                }
            }
        }
        removed
    }

    /// Stop every agent but keep workspaces and records, so the next start
    /// recovers the sessions.
    pub async fn suspend_all(&self) {
        let inner = &self.inner;
        let entries = inner.all();
        let count = entries.len();

        for entry in entries {
            let lock = inner.channel_lock(&entry.channel_id);
            let _guard = lock.lock().await;

            let state = entry.state();
            inner.teardown_agent(&entry, StopReason::Shutdown, true).await;

            let mut record = entry.record();
            record.state = state;
            if let Err(e) = inner.store.upsert(&record) {
                error!("Failed to persist suspended session {}: {}", entry.name, e);
            }
            inner.unregister(&entry.channel_id);
            entry.log.info("Session suspended for daemon restart");
            entry.log.close();
        }
        info!("Suspended {} sessions for recovery", count);
    }

    /// Status of one session.
    pub async fn status(&self, channel_id: &str) -> Option<SessionStatus> {
        let entry = self.inner.get(channel_id)?;
        Some(status_of(&entry).await)
    }

    /// Status of every registered session, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        let mut result = Vec::new();
        for entry in self.inner.all() {
            result.push(status_of(&entry).await);
        }
        result
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

async fn status_of(entry: &SessionEntry) -> SessionStatus {
    let agent_alive = match entry.process().await {
        Some(process) => process.is_alive().await,
        None => false,
    };
    let pending_permission = entry.status().pending_permission.clone();
    SessionStatus {
        record: entry.record(),
        agent_alive,
        pending_permission,
    }
}

/// The record's project must still be registered at the same root.
fn check_project(record: &SessionRecord, projects: &dyn ProjectLookup) -> Result<(), String> {
    match projects.resolve(&record.project_name) {
        None => Err(format!("project not registered: {}", record.project_name)),
        Some(root) if canonical(&root) != canonical(&record.project_root) => Err(format!(
            "project {} moved: {} -> {}",
            record.project_name,
            record.project_root.display(),
            root.display()
        )),
        Some(_) => Ok(()),
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
