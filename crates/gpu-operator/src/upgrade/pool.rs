//! Bounded pool of node workers.
//!
//! Workers are tracked so shutdown can wait for them, capped by a semaphore,
//! deduplicated per node, and grouped under a cancellation token per
//! DeviceConfig scope. Cancelling a scope (spec change or deletion) signals
//! every worker in it; a fresh token is issued for the next generation.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Nodes with a worker queued or running
    active: Arc<DashMap<String, ()>>,
    scopes: DashMap<String, CancellationToken>,
    root: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            tracker: TaskTracker::new(),
            active: Arc::new(DashMap::new()),
            scopes: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Token shared by every worker of `scope`'s current generation
    pub fn scope_token(&self, scope: &str) -> CancellationToken {
        self.scopes
            .entry(scope.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// Signal all workers of `scope` and start a new generation.
    pub fn cancel_scope(&self, scope: &str) {
        if let Some((_, token)) = self.scopes.remove(scope) {
            debug!(scope = %scope, "Cancelling in-flight workers");
            token.cancel();
        }
    }

    /// Spawn `work` for `node` unless a worker for it is already queued or
    /// running. Returns whether a worker was spawned.
    pub fn spawn<F>(&self, node: &str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            warn!(node = %node, "Worker pool shut down, not spawning");
            return false;
        }
        if self.active.insert(node.to_string(), ()).is_some() {
            debug!(node = %node, "Worker already active");
            return false;
        }

        let permits = self.permits.clone();
        let active = self.active.clone();
        let node = node.to_string();
        self.tracker.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                work.await;
            }
            active.remove(&node);
        });
        true
    }

    /// Cancel every scope and wait for workers to observe it.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    #[cfg(test)]
    pub async fn wait_idle(&self) {
        while !self.active.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
