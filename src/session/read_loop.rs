// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session task that turns agent output into state changes and events.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::{AgentMessage, ContentBlock, ResponseStream};
use crate::error::AgentError;
use crate::events::{EventLevel, SessionEvent, StopReason};
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::manager::{Inner, SessionEntry};
use super::types::{PendingPermission, SessionState, Transition};

/// Read until the stream ends or `cancel` fires.
///
/// A cancelled loop returns silently; whoever cancelled it owns the rest of
/// the teardown. A stream that ends on its own marks the session stopped,
/// runs cleanup hooks and publishes `AgentStopped`.
pub(super) async fn run(
    inner: Weak<Inner>,
    entry: Arc<SessionEntry>,
    mut responses: ResponseStream,
    mut cancel: oneshot::Receiver<()>,
    generation: u64,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!("Read loop for {} cancelled", entry.name);
                return;
            }
            message = responses.next() => match message {
                Some(Ok(message)) => {
                    let Some(inner) = inner.upgrade() else { return };
                    handle_message(&inner, &entry, message);
                }
                Some(Err(e)) => break StopReason::CommunicationError(e.to_string()),
                None => break StopReason::ProcessExited,
            }
        }
    };

    {
        let mut status = entry.status();
        if status.generation != generation || status.state.is_stopped() {
            return;
        }
        status.state = SessionState::Stopped;
        status.pending_permission = None;
    }

    let Some(inner) = inner.upgrade() else { return };
    match &reason {
        StopReason::CommunicationError(detail) => {
            warn!("Agent for {} failed: {}", entry.name, detail);
            entry.log.warn(&format!("Agent communication error: {}", detail));
        }
        _ => {
            info!("Agent for {} exited", entry.name);
            entry.log.info("Agent process exited");
        }
    }

    inner.hooks.run(&entry.channel_id).await;

    // A malformed line leaves the process alive
    if let Some(process) = entry.process().await {
        if let Err(e) = process.stop().await {
            debug!("Stopping exited agent for {}: {}", entry.name, e);
        }
    }

    inner.persist(&entry);
    inner.bus.publish(SessionEvent::AgentStopped {
        channel_id: entry.channel_id.clone(),
        session_name: entry.name.clone(),
        reason,
    });
}

fn handle_message(inner: &Arc<Inner>, entry: &Arc<SessionEntry>, message: AgentMessage) {
    match message {
        AgentMessage::Init { session_id } => {
            entry.status().resume_token = Some(session_id.clone());
            inner.persist(entry);
            entry.log.info(&format!("Agent ready: token={}", session_id));
            inner.bus.publish(SessionEvent::AgentReady {
                channel_id: entry.channel_id.clone(),
                resume_token: Some(session_id),
            });
        }

        AgentMessage::Assistant { content } => {
            // A tool that already reported its result ran without approval
            let tool_use = content.iter().find_map(|block| match block {
                ContentBlock::ToolUse { id, name, .. } if !has_result(&content, id) => {
                    Some((id.clone(), name.clone()))
                }
                _ => None,
            });

            match tool_use {
                Some((request_id, tool_name)) => {
                    let waiting = {
                        let mut status = entry.status();
                        status.state = status.state.apply(Transition::ToolUse);
                        let waiting = status.state == SessionState::WaitingPermission;
                        if waiting {
                            status.pending_permission = Some(PendingPermission {
                                request_id: request_id.clone(),
                                tool_name: tool_name.clone(),
                                requested_at: Utc::now(),
                            });
                        }
                        waiting
                    };
                    entry.log.info(&format!("Tool use: {} (id={})", tool_name, request_id));
                    if waiting {
                        arm_permission_timeout(inner, entry, request_id);
                    }
                }
                None => {
                    entry.transition(Transition::AssistantOutput);
                }
            }

            let level = EventLevel::for_output(&content);
            inner.bus.publish(SessionEvent::AgentOutput {
                channel_id: entry.channel_id.clone(),
                session_name: entry.name.clone(),
                content,
                level,
                verbose: entry.verbose,
            });
        }

        AgentMessage::PermissionRequest {
            id,
            tool_name,
            tool_input,
        } => {
            {
                let mut status = entry.status();
                status.state = status.state.apply(Transition::PermissionRequest);
                if status.state != SessionState::WaitingPermission {
                    return;
                }
                status.pending_permission = Some(PendingPermission {
                    request_id: id.clone(),
                    tool_name: tool_name.clone(),
                    requested_at: Utc::now(),
                });
            }
            entry.log.info(&format!("Permission requested: {} (id={})", tool_name, id));
            arm_permission_timeout(inner, entry, id.clone());
            inner.bus.publish(SessionEvent::PermissionRequested {
                channel_id: entry.channel_id.clone(),
                request_id: id,
                tool_name,
                tool_input,
            });
        }

        AgentMessage::Result {
            cost_usd,
            duration_ms,
            is_error,
            ..
        } => {
            {
                let mut status = entry.status();
                status.state = status.state.apply(Transition::TurnResult);
                status.pending_permission = None;
            }

            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_cost(cost_usd);

            entry.log.info(&format!(
                "Turn complete: cost=${:.4} duration={}ms{}",
                cost_usd,
                duration_ms,
                if is_error { " (error)" } else { "" }
            ));
            inner.bus.publish(SessionEvent::AgentResult {
                channel_id: entry.channel_id.clone(),
                cost_usd,
                duration_ms,
            });
            inner.bus.publish(SessionEvent::InputRequested {
                channel_id: entry.channel_id.clone(),
                session_name: entry.name.clone(),
            });
        }

        other => debug!("Ignoring {} message for {}", other.kind(), entry.name),
    }
}

fn has_result(content: &[ContentBlock], tool_use_id: &str) -> bool {
    content.iter().any(|block| {
        matches!(block, ContentBlock::ToolResult { tool_use_id: id, .. } if id == tool_use_id)
    })
}

/// Auto-deny `request_id` if it is still pending when the configured
/// timeout expires.
fn arm_permission_timeout(inner: &Arc<Inner>, entry: &Arc<SessionEntry>, request_id: String) {
    let Some(timeout) = inner.options.permission_timeout else {
        return;
    };
    tokio::spawn(deny_after(
        Arc::downgrade(inner),
        entry.clone(),
        request_id,
        timeout,
    ));
}

fn still_pending(entry: &SessionEntry, request_id: &str) -> Option<u64> {
    let status = entry.status();
    let pending = status.state == SessionState::WaitingPermission
        && status
            .pending_permission
            .as_ref()
            .is_some_and(|p| p.request_id == request_id);
    pending.then_some(status.generation)
}

async fn deny_after(inner: Weak<Inner>, entry: Arc<SessionEntry>, request_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(generation) = still_pending(&entry, &request_id) else {
        return;
    };
    let Some(process) = entry.process().await else {
        return;
    };

    warn!(
        "Permission request {} for {} timed out after {:?}, denying",
        request_id, entry.name, timeout
    );
    match process.send_permission_response(&request_id, false).await {
        Ok(()) => {
            {
                let mut status = entry.status();
                if status.generation == generation
                    && status
                        .pending_permission
                        .as_ref()
                        .is_some_and(|p| p.request_id == request_id)
                {
                    status.state = status.state.apply(Transition::PermissionAnswered);
                    status.pending_permission = None;
                }
            }
            entry.log.warn(&format!("Permission timed out, denied: id={}", request_id));
        }
        Err(AgentError::Communication(detail)) => {
            if let Some(inner) = inner.upgrade() {
                inner.fail_agent(&entry, generation, detail).await;
            }
        }
        Err(e) => warn!("Auto-deny for {} failed: {}", entry.name, e),
    }
}
