//! Node Upgrade Worker.
//!
//! One worker runs per admitted node: cordon, drain, then either hand over
//! to the reboot coordinator or relabel directly. Every phase write is
//! skipped once the worker's scope token is cancelled, so a spec change or
//! a DeviceConfig deletion that happened mid-flight always wins.

use super::drain::{drain_node, DrainSettings};
use super::state::FleetStateStore;
use crate::cluster::{update_node, ClusterClient};
use crate::config::OperatorConfig;
use crate::crds::{DeviceConfig, UpgradePhase};
use crate::error::Result;
use crate::nodes;
use crate::wait::WaitOutcome;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Add (`cordon = true`) or remove the upgrade taint.
pub async fn set_cordon(
    client: &dyn ClusterClient,
    node: &str,
    attempts: u32,
    cordon: bool,
) -> Result<Node> {
    let updated = if cordon {
        update_node(client, node, attempts, nodes::add_upgrade_taint).await?
    } else {
        update_node(client, node, attempts, nodes::remove_upgrade_taint).await?
    };
    debug!(node = %node, cordon, "Upgrade taint updated");
    Ok(updated)
}

/// Point the version-module label at `version`.
pub async fn set_version_label(
    client: &dyn ClusterClient,
    node: &str,
    label_key: &str,
    version: &str,
    attempts: u32,
) -> Result<Node> {
    update_node(client, node, attempts, |n| nodes::set_label(n, label_key, version)).await
}

/// Everything one node's upgrade needs, cloned into its task
#[derive(Clone)]
pub struct NodeWorker {
    pub client: Arc<dyn ClusterClient>,
    pub store: Arc<FleetStateStore>,
    pub config: Arc<OperatorConfig>,
    pub dc: Arc<DeviceConfig>,
    pub node: String,
    /// Driver version this node is moving to
    pub version: String,
    pub token: CancellationToken,
}

impl NodeWorker {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Move the node from `from` to `to` unless the worker has been
    /// abandoned or the node's phase moved on without it (timed out to
    /// `Failed`, reset for a new rollout).
    pub fn transition(&self, from: UpgradePhase, to: UpgradePhase) -> bool {
        if self.is_cancelled() {
            debug!(node = %self.node, phase = %to, "Worker cancelled, phase not recorded");
            return false;
        }
        if self.store.compare_and_set(&self.node, from, to) {
            return true;
        }
        let current = self.store.phase(&self.node);
        if current != to {
            warn!(node = %self.node, %current, expected = %from, phase = %to, "Node phase changed under the worker, not recorded");
        }
        false
    }

    pub async fn update_version_label(&self) -> Result<Node> {
        set_version_label(
            self.client.as_ref(),
            &self.node,
            &self.dc.version_label_key(),
            &self.version,
            self.config.conflict_retry_attempts,
        )
        .await
    }

    async fn label_already_current(&self) -> bool {
        match self.client.get_node(&self.node).await {
            Ok(node) => nodes::label(&node, &self.dc.version_label_key()) == Some(self.version.as_str()),
            Err(e) => {
                debug!(node = %self.node, error = %e, "Could not re-read node before upgrade");
                false
            }
        }
    }

    /// Drive the node from `Started` to `InProgress` (or a failure phase).
    pub async fn run(self) {
        info!(node = %self.node, version = %self.version, "Node upgrade begin");

        // A restarted operator may re-admit a node whose label is already set
        if self.label_already_current().await {
            info!(node = %self.node, "Version label already set, upgrade in progress");
            self.transition(UpgradePhase::Started, UpgradePhase::InProgress);
            return;
        }

        let cordon = set_cordon(
            self.client.as_ref(),
            &self.node,
            self.config.conflict_retry_attempts,
            true,
        )
        .await;
        if self.is_cancelled() {
            return;
        }
        if let Err(e) = cordon {
            error!(node = %self.node, error = %e, "Cordon failed");
            self.transition(UpgradePhase::Started, UpgradePhase::CordonFailed);
            return;
        }

        let policy = self.dc.active_upgrade_policy().cloned().unwrap_or_default();
        let settings = DrainSettings::from_policy(&policy);
        let drained = drain_node(
            self.client.as_ref(),
            &self.dc.name_or_default(),
            &self.node,
            &settings,
            self.config.drain_poll_interval(),
            &self.token,
        )
        .await;
        if self.is_cancelled() {
            return;
        }
        match drained {
            Ok(WaitOutcome::Cancelled) => return,
            Ok(_) => {}
            Err(e) => {
                error!(node = %self.node, error = %e, "Drain failed");
                self.transition(UpgradePhase::Started, UpgradePhase::DrainFailed);
                return;
            }
        }

        if policy.reboot_required {
            self.reboot().await;
            return;
        }

        match self.update_version_label().await {
            Ok(_) => {
                info!(node = %self.node, "Reboot not required, upgrade in progress");
                self.transition(UpgradePhase::Started, UpgradePhase::InProgress);
            }
            Err(e) => {
                error!(node = %self.node, error = %e, "Version label update failed");
                self.transition(UpgradePhase::Started, UpgradePhase::Failed);
            }
        }
    }
}
