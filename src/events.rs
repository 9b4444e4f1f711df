// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed publish/subscribe hub.
//!
//! Session read loops publish [`SessionEvent`]s; renderers and stores
//! subscribe per [`EventKind`]. Each subscriber owns a bounded queue, so a
//! slow consumer only ever loses its own events.
//!
//! The bus is built once at startup and passed to the components that need
//! it. [`EventBus::close`] ends every subscription at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::ContentBlock;
use crate::config::DEFAULT_EVENT_QUEUE_CAPACITY;
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

/// How important an event is to a human watching the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// System internals (agent init).
    Internal,
    /// Tool use and other intermediate work.
    Progress,
    /// Agent text output.
    Info,
    /// Turn completion and lifecycle changes.
    Notify,
}

impl EventLevel {
    /// `Info` if the output contains any text, otherwise `Progress`.
    pub fn for_output(content: &[ContentBlock]) -> Self {
        if content.iter().any(ContentBlock::is_text) {
            Self::Info
        } else {
            Self::Progress
        }
    }
}

/// Why an agent stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// `stop_session` was called.
    Requested,
    /// `complete_session` was called.
    Completed,
    /// The process closed its output or exited.
    ProcessExited,
    /// Broken pipe or malformed protocol line.
    CommunicationError(String),
    /// The daemon is shutting down; the session will be recovered.
    Shutdown,
}

/// Event kinds, one queue family each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    AgentReady,
    AgentOutput,
    AgentResult,
    PermissionRequested,
    InputRequested,
    AgentStopped,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::SessionCreated,
        EventKind::AgentReady,
        EventKind::AgentOutput,
        EventKind::AgentResult,
        EventKind::PermissionRequested,
        EventKind::InputRequested,
        EventKind::AgentStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::AgentReady => "agent_ready",
            Self::AgentOutput => "agent_output",
            Self::AgentResult => "agent_result",
            Self::PermissionRequested => "permission_requested",
            Self::InputRequested => "input_requested",
            Self::AgentStopped => "agent_stopped",
        }
    }
}

/// Everything a session publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        channel_id: String,
        name: String,
        project_name: String,
        project_root: String,
        workspace_path: String,
        verbose: bool,
    },
    AgentReady {
        channel_id: String,
        resume_token: Option<String>,
    },
    AgentOutput {
        channel_id: String,
        session_name: String,
        content: Vec<ContentBlock>,
        level: EventLevel,
        verbose: bool,
    },
    AgentResult {
        channel_id: String,
        cost_usd: f64,
        duration_ms: u64,
    },
    PermissionRequested {
        channel_id: String,
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },
    InputRequested {
        channel_id: String,
        session_name: String,
    },
    AgentStopped {
        channel_id: String,
        session_name: String,
        reason: StopReason,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionCreated { .. } => EventKind::SessionCreated,
            Self::AgentReady { .. } => EventKind::AgentReady,
            Self::AgentOutput { .. } => EventKind::AgentOutput,
            Self::AgentResult { .. } => EventKind::AgentResult,
            Self::PermissionRequested { .. } => EventKind::PermissionRequested,
            Self::InputRequested { .. } => EventKind::InputRequested,
            Self::AgentStopped { .. } => EventKind::AgentStopped,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Self::SessionCreated { channel_id, .. }
            | Self::AgentReady { channel_id, .. }
            | Self::AgentOutput { channel_id, .. }
            | Self::AgentResult { channel_id, .. }
            | Self::PermissionRequested { channel_id, .. }
            | Self::InputRequested { channel_id, .. }
            | Self::AgentStopped { channel_id, .. } => channel_id,
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            Self::AgentReady { .. } => EventLevel::Internal,
            Self::AgentOutput { level, .. } => *level,
            Self::PermissionRequested { .. } | Self::InputRequested { .. } => EventLevel::Info,
            Self::SessionCreated { .. } | Self::AgentResult { .. } | Self::AgentStopped { .. } => {
                EventLevel::Notify
            }
        }
    }
}

/// Identifies one subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match subscribers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|s| s.id != id);
                before != list.len()
            }
            None => false,
        }
    }
}

/// Process-wide event hub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new queue for one event kind.
    ///
    /// After [`close`](Self::close) the returned subscription is already ended.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.inner.closed.load(Ordering::Acquire) {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.entry(kind).or_default().push(Subscriber { id, tx });
        }

        Subscription {
            kind,
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deregister a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.remove(kind, id.0)
    }

    /// Deliver an event to every queue subscribed to its kind.
    ///
    /// Never waits: a full queue loses this event for that subscriber only.
    pub fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        let mut delivered = 0u64;
        let mut gone = Vec::new();

        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(list) = subscribers.get(&kind) else {
                return;
            };

            for sub in list {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Event queue full, dropping {} for subscriber {}",
                            kind.as_str(),
                            sub.id
                        );
                        #[cfg(feature = "telemetry")]
                        GLOBAL_METRICS.record_event_dropped(kind.as_str());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(sub.id),
                }
            }
        }

        for id in gone {
            debug!("Pruning closed {} subscriber {}", kind.as_str(), id);
            self.inner.remove(kind, id);
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_event_published(kind.as_str(), delivered);
        #[cfg(not(feature = "telemetry"))]
        let _ = delivered;
    }

    /// Number of live subscribers for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Shut the bus down: drop every queue and refuse new subscriptions.
    ///
    /// Subscribers drain what was already queued, then see `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's queue for one event kind.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    rx: mpsc::Receiver<SessionEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        SubscriptionId(self.id)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Next event; `None` once unsubscribed (or the bus closed) and drained.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(channel: &str, duration_ms: u64) -> SessionEvent {
        SessionEvent::AgentResult {
            channel_id: channel.to_string(),
            cost_usd: 0.0,
            duration_ms,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_kind_only() {
        let bus = EventBus::new();
        let mut results = bus.subscribe(EventKind::AgentResult);
        let mut ready = bus.subscribe(EventKind::AgentReady);

        bus.publish(result("c1", 1));

        assert_eq!(results.next().await, Some(result("c1", 1)));
        assert!(ready.try_next().is_none());
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(EventKind::AgentResult);
        let mut b = bus.subscribe(EventKind::AgentResult);

        for i in 0..10 {
            bus.publish(result("c1", i));
        }
        for i in 0..10 {
            assert_eq!(a.next().await, Some(result("c1", i)));
        }
        for i in 0..10 {
            assert_eq!(b.next().await, Some(result("c1", i)));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let bus = EventBus::with_capacity(2);
        let mut slow = bus.subscribe(EventKind::AgentResult);
        let mut fast = bus.subscribe(EventKind::AgentResult);

        bus.publish(result("c1", 1));
        assert_eq!(fast.next().await, Some(result("c1", 1)));
        bus.publish(result("c1", 2));
        assert_eq!(fast.next().await, Some(result("c1", 2)));
        bus.publish(result("c1", 3));
        assert_eq!(fast.next().await, Some(result("c1", 3)));

        assert_eq!(slow.next().await, Some(result("c1", 1)));
        assert_eq!(slow.next().await, Some(result("c1", 2)));
        assert!(slow.try_next().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_sequence_after_drain() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventKind::AgentResult);
        bus.publish(result("c1", 1));

        assert!(bus.unsubscribe(EventKind::AgentResult, sub.id()));
        assert!(!bus.unsubscribe(EventKind::AgentResult, sub.id()));
        bus.publish(result("c1", 2));

        assert_eq!(sub.next().await, Some(result("c1", 1)));
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventKind::AgentStopped);
        assert_eq!(bus.subscriber_count(EventKind::AgentStopped), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(EventKind::AgentStopped), 0);
    }

    #[tokio::test]
    async fn test_close_ends_all_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventKind::AgentResult);
        bus.publish(result("c1", 1));
        bus.close();

        assert_eq!(sub.next().await, Some(result("c1", 1)));
        assert_eq!(sub.next().await, None);

        let mut late = bus.subscribe(EventKind::AgentResult);
        assert_eq!(late.next().await, None);
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let bus = EventBus::new();
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..1000 {
                    bus.publish(result("c1", i));
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        for _ in 0..50 {
            let sub = bus.subscribe(EventKind::AgentResult);
            tokio::task::yield_now().await;
            drop(sub);
        }
        publisher.await.unwrap();
        assert_eq!(bus.subscriber_count(EventKind::AgentResult), 0);
    }

    #[test]
    fn test_levels() {
        let text = vec![ContentBlock::Text { text: "hi".into() }];
        let tool = vec![ContentBlock::ToolUse {
            id: "t".into(),
            name: "Bash".into(),
            input: Value::Null,
        }];
        assert_eq!(EventLevel::for_output(&text), EventLevel::Info);
        assert_eq!(EventLevel::for_output(&tool), EventLevel::Progress);
        assert_eq!(result("c", 1).level(), EventLevel::Notify);
    }
}
