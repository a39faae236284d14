//! Optimistic-concurrency helpers.
//!
//! Node labels and taints are written by several actors (kubelet, KMM, other
//! operators). Updates are read-modify-write against the current
//! `resourceVersion` and are retried a bounded number of times on 409.

use super::ClusterClient;
use crate::error::Result;
use k8s_openapi::api::core::v1::Node;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Run `op` until it succeeds, fails with a non-conflict error, or
/// `attempts` conflicts have been seen.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, "Conflict on update, retrying");
                attempt += 1;
                tokio::time::sleep(CONFLICT_BACKOFF).await;
            }
            other => return other,
        }
    }
}

/// Fetch node `name`, apply `mutate`, and write it back if `mutate` reported
/// a change. Returns the node as last seen.
pub async fn update_node<F>(
    client: &dyn ClusterClient,
    name: &str,
    attempts: u32,
    mutate: F,
) -> Result<Node>
where
    F: Fn(&mut Node) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(attempts, || async move {
        let mut node = client.get_node(name).await?;
        if !mutate(&mut node) {
            return Ok(node);
        }
        client.replace_node(&node).await
    })
    .await
}
