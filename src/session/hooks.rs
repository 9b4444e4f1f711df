// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Capability cleanup hooks run when a session stops or completes.

use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error};

/// Teardown callback registered by a capability (tunnels, previews, ...).
///
/// Must be idempotent and must tolerate channels it holds no state for.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup(&self, channel_id: &str) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "cleanup-hook"
    }
}

/// Adapts an async closure into a [`CleanupHook`].
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHook<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> CleanupHook for FnHook<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn cleanup(&self, channel_id: &str) -> anyhow::Result<()> {
        (self.f)(channel_id.to_string()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered hook registry.
#[derive(Default)]
pub struct CleanupHooks {
    hooks: RwLock<Vec<Arc<dyn CleanupHook>>>,
}

impl CleanupHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn CleanupHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook in registration order.
    ///
    /// Each hook runs on its own task, so an error or panic in one is logged
    /// and the rest still run. Returns the number of hooks that failed.
    pub async fn run(&self, channel_id: &str) -> usize {
        let hooks: Vec<Arc<dyn CleanupHook>> = self
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut failures = 0;
        for hook in hooks {
            let name = hook.name().to_string();
            let channel = channel_id.to_string();
            let task = tokio::spawn(async move { hook.cleanup(&channel).await });

            match task.await {
                Ok(Ok(())) => debug!("Cleanup hook {} done for {}", name, channel_id),
                Ok(Err(e)) => {
                    failures += 1;
                    error!("Cleanup hook {} failed for {}: {:#}", name, channel_id, e);
                }
                Err(e) => {
                    failures += 1;
                    error!("Cleanup hook {} panicked for {}: {}", name, channel_id, e);
                }
            }
        }
        failures
    }
}
