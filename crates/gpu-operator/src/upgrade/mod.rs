//! Node Upgrade Orchestrator.
//!
//! [`UpgradeManager::handle_upgrade`] runs once per reconcile pass. It
//! classifies every node into exactly one bucket, and when the upgrade
//! policy leaves room it admits candidates in list order and hands each to
//! a [`worker::NodeWorker`] running on the [`pool::WorkerPool`]. Phases live
//! in the [`state::FleetStateStore`]; the controller persists them to the
//! DeviceConfig status so they can be rebuilt after a restart.

pub mod drain;
pub mod policy;
pub mod pool;
pub mod reboot;
pub mod state;
pub mod worker;


use crate::clock::{parse_timestamp, Clock};
use crate::cluster::{update_node, ClusterClient};
use crate::config::OperatorConfig;
use crate::crds::{DeviceConfig, UpgradePhase};
use crate::error::{Error, Result};
use crate::nodes::{self, UPGRADE_REQUIRED, UPGRADE_STATE_LABEL};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use pool::WorkerPool;
use state::FleetStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use worker::{set_cordon, set_version_label, NodeWorker};

/// Last driver spec seen per scope. Only a version change starts a fresh
/// rollout; toggling `enable` alone leaves node phases as they are.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DriverSpecSnapshot {
    version: String,
}

impl DriverSpecSnapshot {
    fn of(dc: &DeviceConfig) -> Self {
        Self {
            version: dc.spec.driver.version.clone(),
        }
    }
}

/// Where one node stands in the current pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Failed,
    InProgress,
    Done,
    Install,
    NotReady,
    Candidate,
}

#[derive(Debug, Default)]
struct Tally {
    failed: usize,
    in_progress: usize,
    done: usize,
    install: usize,
    not_ready: usize,
}

pub struct UpgradeManager {
    client: Arc<dyn ClusterClient>,
    store: Arc<FleetStateStore>,
    pool: Arc<WorkerPool>,
    config: Arc<OperatorConfig>,
    clock: Arc<dyn Clock>,
    snapshots: DashMap<String, DriverSpecSnapshot>,
}

impl UpgradeManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: Arc<OperatorConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            store: Arc::new(FleetStateStore::new()),
            pool: Arc::new(WorkerPool::new(config.max_concurrent_workers)),
            config,
            clock,
            snapshots: DashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<FleetStateStore> {
        self.store.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    fn requeue(&self) -> Option<Duration> {
        Some(self.config.requeue_delay())
    }

    fn attempts(&self) -> u32 {
        self.config.conflict_retry_attempts
    }

    fn node_worker(&self, dc: &Arc<DeviceConfig>, node: &str, version: &str, token: &CancellationToken) -> NodeWorker {
        NodeWorker {
            client: self.client.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            dc: dc.clone(),
            node: node.to_string(),
            version: version.to_string(),
            token: token.clone(),
        }
    }

    /// Run one upgrade pass over `nodes`. Returns the requested requeue
    /// delay, `None` when nothing is pending.
    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn handle_upgrade(&self, dc: &DeviceConfig, nodes: &[Node]) -> Result<Option<Duration>> {
        let Some(policy) = dc.active_upgrade_policy() else {
            debug!("Upgrade policy disabled, nothing to orchestrate");
            return Ok(None);
        };

        let scope = dc.scope_key();
        let shared_dc = Arc::new(dc.clone());
        let current = DriverSpecSnapshot::of(dc);
        let previous = self.snapshots.insert(scope.clone(), current.clone());
        match previous {
            None => {
                info!("Initializing node upgrade states from DeviceConfig status");
                let token = self.pool.scope_token(&scope);
                self.recover_states(&shared_dc, policy.reboot_required, &token).await;
            }
            Some(previous) if previous != current && !previous.version.is_empty() => {
                info!(from = %previous.version, to = %current.version, "Driver spec changed, resetting node states");
                self.pool.cancel_scope(&scope);
                self.reset_for_new_rollout(nodes);
            }
            Some(_) => {}
        }
        let token = self.pool.scope_token(&scope);

        let mut tally = Tally::default();
        let mut candidates: Vec<(&Node, String)> = Vec::new();
        let mut errors = Vec::new();

        for node in nodes {
            let name = node.name_any();
            let Some(version) = target_version(dc, node) else {
                warn!(node = %name, "No driver version for node OS, skipping");
                continue;
            };
            match self.classify(dc, node, &version, &mut errors).await {
                Bucket::Failed => tally.failed += 1,
                Bucket::InProgress => tally.in_progress += 1,
                Bucket::Done => tally.done += 1,
                Bucket::Install => tally.install += 1,
                Bucket::NotReady => tally.not_ready += 1,
                Bucket::Candidate => candidates.push((node, version)),
            }
        }
        debug!(?tally, candidates = candidates.len(), "Nodes classified");

        let pending = tally.in_progress + tally.failed + tally.install;
        let result = if candidates.is_empty() && pending > 0 {
            self.requeue()
        } else if tally.done == nodes.len() || candidates.is_empty() {
            if tally.not_ready > 0 {
                self.requeue()
            } else {
                None
            }
        } else {
            let decision = policy::evaluate(policy, nodes.len(), tally.in_progress, tally.failed)?;
            if decision.violated {
                debug!(
                    allowed = decision.allowed,
                    in_progress = tally.in_progress,
                    failed = tally.failed,
                    "Upgrade policy leaves no room this pass"
                );
            } else {
                let now = self.clock.now();
                for (node, version) in candidates.into_iter().take(decision.admissible(tally.in_progress)) {
                    self.admit(&shared_dc, &node.name_any(), &version, &token, now);
                }
            }
            self.requeue()
        };

        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    fn admit(&self, dc: &Arc<DeviceConfig>, node: &str, version: &str, token: &CancellationToken, now: DateTime<Utc>) {
        self.store.set_phase(node, UpgradePhase::Started);
        self.store.set_started_at(node, now);
        let worker = self.node_worker(dc, node, version, token);
        if !self.pool.spawn(node, worker.run()) {
            // A cancelled worker for this node has not exited yet
            warn!(node = %node, "Previous worker still running, retrying next pass");
            self.store.set_phase(node, UpgradePhase::NotStarted);
            self.store.clear_started_at(node);
        }
    }

    /// Put each node in exactly one bucket, applying the transitions that
    /// classification itself owns (init, timeout, completion, relabel).
    async fn classify(&self, dc: &DeviceConfig, node: &Node, version: &str, errors: &mut Vec<Error>) -> Bucket {
        let name = node.name_any();
        let persisted = dc.persisted_node_status(&name);
        let label_key = dc.version_label_key();
        let label = nodes::label(node, &label_key);

        if self.store.phase(&name) == UpgradePhase::Empty {
            self.store.set_phase(&name, UpgradePhase::NotStarted);
        }
        if self.store.phase(&name).is_failure() && nodes::label(node, UPGRADE_STATE_LABEL) == Some(UPGRADE_REQUIRED) {
            match self.requeue_failed_node(dc, &name).await {
                Ok(()) => {
                    info!(node = %name, "Failed node labelled for retry, upgrade restarts");
                    self.store.set_phase(&name, UpgradePhase::NotStarted);
                    self.store.clear_started_at(&name);
                }
                Err(e) => {
                    error!(node = %name, error = %e, "Failed to requeue node for upgrade");
                    errors.push(e);
                }
            }
        }

        if self.timed_out(dc, &name) {
            warn!(node = %name, phase = %self.store.phase(&name), "Upgrade timeout exceeded");
            self.store.set_phase(&name, UpgradePhase::Failed);
        }

        let phase = self.store.phase(&name);
        if phase.is_failure() {
            if phase == UpgradePhase::Failed {
                self.store.clear_started_at(&name);
            }
            return Bucket::Failed;
        }

        // KMM may drop the module status across a reboot
        if persisted.is_some_and(|s| s.container_image.is_empty()) && phase == UpgradePhase::InProgress {
            return match set_cordon(self.client.as_ref(), &name, self.attempts(), false).await {
                Ok(_) => Bucket::InProgress,
                Err(e) => {
                    error!(node = %name, error = %e, "Uncordon failed");
                    self.store.set_phase(&name, UpgradePhase::UncordonFailed);
                    Bucket::Failed
                }
            };
        }

        if matches!(phase, UpgradePhase::Started | UpgradePhase::RebootInProgress) {
            return Bucket::InProgress;
        }

        let driver_ready = persisted.is_some_and(|s| !s.container_image.is_empty() && s.container_image.ends_with(version));
        if driver_ready {
            if phase.is_complete() {
                return Bucket::Done;
            }
            if let Err(e) = set_cordon(self.client.as_ref(), &name, self.attempts(), false).await {
                error!(node = %name, error = %e, "Uncordon failed");
                self.store.set_phase(&name, UpgradePhase::UncordonFailed);
                return Bucket::Failed;
            }
            let complete = if phase == UpgradePhase::InstallInProgress {
                UpgradePhase::InstallComplete
            } else {
                UpgradePhase::Complete
            };
            self.store.set_phase(&name, complete);
            self.store.clear_started_at(&name);
            return Bucket::Done;
        }

        // New nodes install unconditionally, outside the policy
        let install_restarted = label.is_some_and(|l| l != version)
            && persisted.is_some_and(|s| s.status == UpgradePhase::InstallInProgress);
        if label.is_none() || install_restarted {
            if install_restarted {
                if let Err(e) = set_version_label(self.client.as_ref(), &name, &label_key, version, self.attempts()).await {
                    error!(node = %name, error = %e, "Version label update failed");
                    self.store.set_phase(&name, UpgradePhase::Failed);
                    return Bucket::Failed;
                }
            }
            self.store.set_phase(&name, UpgradePhase::InstallInProgress);
            return Bucket::Install;
        }

        if phase == UpgradePhase::InstallInProgress {
            return Bucket::Install;
        }

        if phase == UpgradePhase::InProgress {
            if label != Some(version) {
                if let Err(e) = set_version_label(self.client.as_ref(), &name, &label_key, version, self.attempts()).await {
                    error!(node = %name, error = %e, "Version label update failed");
                    self.store.set_phase(&name, UpgradePhase::Failed);
                    return Bucket::Failed;
                }
            }
            return Bucket::InProgress;
        }

        if !nodes::is_ready_for_upgrade(node) {
            debug!(node = %name, "Node not ready for upgrade");
            return Bucket::NotReady;
        }

        Bucket::Candidate
    }

    /// Elapsed time since the upgrade started exceeds the configured limit.
    fn timed_out(&self, dc: &DeviceConfig, node: &str) -> bool {
        if !self.store.phase(node).is_timeout_tracked() {
            return false;
        }
        let started = self.store.started_at(node).or_else(|| {
            dc.persisted_node_status(node)
                .filter(|s| s.status.is_timeout_tracked())
                .and_then(|s| parse_timestamp(&s.upgrade_start_time))
        });
        started.is_some_and(|at| self.clock.now() - at > self.config.upgrade_timeout())
    }

    /// Drop the retry label and point the version label back at the module
    /// KMM reports loaded, so the next rollout re-applies the target.
    async fn requeue_failed_node(&self, dc: &DeviceConfig, node: &str) -> Result<()> {
        update_node(self.client.as_ref(), node, self.attempts(), |n| {
            nodes::label(n, UPGRADE_STATE_LABEL) == Some(UPGRADE_REQUIRED) && nodes::remove_label(n, UPGRADE_STATE_LABEL)
        })
        .await?;

        let Some(nmc) = self.client.get_node_modules_config(node).await? else {
            debug!(node = %node, "No NodeModulesConfig, keeping version label");
            return Ok(());
        };
        let namespace = dc.namespace_or_default();
        let name = dc.name_or_default();
        let Some(loaded) = nmc
            .module_status(&namespace, &name)
            .map(|m| m.config.container_image.as_str())
            .filter(|image| !image.is_empty())
        else {
            debug!(node = %node, "Loaded module image unknown, keeping version label");
            return Ok(());
        };
        let loaded_version = loaded.rsplit('-').next().unwrap_or(loaded).to_string();

        let label_key = dc.version_label_key();
        update_node(self.client.as_ref(), node, self.attempts(), |n| {
            nodes::label(n, &label_key).is_some() && nodes::set_label(n, &label_key, &loaded_version)
        })
        .await?;
        Ok(())
    }

    /// First activation for a DeviceConfig: rebuild phases from the
    /// persisted per-node status and resume interrupted reboots.
    async fn recover_states(&self, dc: &Arc<DeviceConfig>, reboot_required: bool, token: &CancellationToken) {
        let Some(status) = dc.status.as_ref() else {
            return;
        };
        for (name, persisted) in &status.node_module_status {
            if let Some(at) = parse_timestamp(&persisted.upgrade_start_time) {
                self.store.set_started_at(name, at);
            }
            match persisted.status {
                UpgradePhase::Started if reboot_required => {
                    let node = match self.client.get_node(name).await {
                        Ok(node) => node,
                        Err(e) => {
                            warn!(node = %name, error = %e, "Cannot read node to resume reboot");
                            continue;
                        }
                    };
                    let live = nodes::boot_id(&node).unwrap_or_default().to_string();
                    let version = target_version(dc, &node).unwrap_or_default();
                    let worker = self.node_worker(dc, name, &version, token);
                    if live == persisted.boot_id {
                        info!(node = %name, "Reboot required but not yet performed, triggering reboot");
                        self.store.set_phase(name, UpgradePhase::Started);
                        self.pool.spawn(name, async move { worker.reboot().await });
                    } else {
                        info!(node = %name, "Node already rebooted, scheduling reboot pod cleanup");
                        self.store.set_boot_id(name, &live);
                        self.resume_reboot_cleanup(dc, name, worker).await;
                    }
                }
                UpgradePhase::Started => {
                    let worker = self.node_worker(dc, name, "", token);
                    self.pool.spawn(name, async move { worker.finish_reboot(true).await });
                    self.store.set_phase(name, UpgradePhase::Empty);
                }
                UpgradePhase::RebootInProgress => {
                    let version = dc.spec.driver.version.clone();
                    let worker = self.node_worker(dc, name, &version, token);
                    self.resume_reboot_cleanup(dc, name, worker).await;
                }
                other => {
                    self.store.set_phase(name, other);
                }
            }
            if !persisted.boot_id.is_empty() && self.store.boot_id(name).is_none() {
                self.store.set_boot_id(name, &persisted.boot_id);
            }
        }
    }

    async fn resume_reboot_cleanup(&self, dc: &DeviceConfig, node: &str, worker: NodeWorker) {
        let pod_name = reboot::reboot_pod_name(node);
        match self.client.get_pod(&dc.namespace_or_default(), &pod_name).await {
            Ok(Some(_)) => {
                self.store.set_phase(node, UpgradePhase::RebootInProgress);
                self.pool.spawn(node, async move { worker.finish_reboot(false).await });
            }
            Ok(None) => {
                debug!(node = %node, "Reboot pod gone, upgrade in progress");
                self.store.set_phase(node, UpgradePhase::InProgress);
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Cannot read reboot pod, assuming reboot finished");
                self.store.set_phase(node, UpgradePhase::InProgress);
            }
        }
    }

    /// Reset every node that is not failed, and failed nodes an operator has
    /// already uncordoned, so the new version rolls out from scratch.
    fn reset_for_new_rollout(&self, nodes: &[Node]) {
        for node in nodes {
            let name = node.name_any();
            let phase = self.store.phase(&name);
            if !phase.is_failure() || !nodes::has_upgrade_taint(node) {
                self.store.set_phase(&name, UpgradePhase::NotStarted);
                self.store.clear_started_at(&name);
            }
        }
    }

    /// DeviceConfig is going away: stop workers, uncordon, remove reboot pods.
    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn handle_delete(&self, dc: &DeviceConfig, nodes: &[Node]) -> Result<()> {
        let scope = dc.scope_key();
        self.pool.cancel_scope(&scope);
        let namespace = dc.namespace_or_default();

        for node in nodes {
            let name = node.name_any();
            if let Err(e) = set_cordon(self.client.as_ref(), &name, self.attempts(), false).await {
                error!(node = %name, error = %e, "Taint removal failed during DeviceConfig delete");
            }
            if let Err(e) = self
                .client
                .delete_pod(&namespace, &reboot::reboot_pod_name(&name), Some(0))
                .await
            {
                error!(node = %name, error = %e, "Reboot pod removal failed during DeviceConfig delete");
            }
            self.store.forget(&name);
        }
        self.snapshots.remove(&scope);
        info!(nodes = nodes.len(), "Upgrade state cleared");
        Ok(())
    }
}

/// Target driver version for `node`: the spec version, else the OS default
pub fn target_version(dc: &DeviceConfig, node: &Node) -> Option<String> {
    if dc.spec.driver.version.is_empty() {
        nodes::default_driver_version(node).map(ToString::to_string)
    } else {
        Some(dc.spec.driver.version.clone())
    }
}
