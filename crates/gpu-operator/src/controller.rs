//! DeviceConfig reconciliation.
//!
//! Every pass lists the nodes the DeviceConfig selects, runs the upgrade
//! orchestrator and the remediation dispatcher over them, and writes the
//! per-node module status back to the DeviceConfig. Deleting a DeviceConfig
//! runs both subsystems' cleanup behind a finalizer.

use crate::clock::{format_timestamp, Clock};
use crate::cluster::ClusterClient;
use crate::config::OperatorConfig;
use crate::crds::deviceconfig::DEVICE_CONFIG_FINALIZER;
use crate::crds::DeviceConfig;
use crate::error::{Error, Result};
use crate::remediation::RemediationDispatcher;
use crate::upgrade::UpgradeManager;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Both subsystems over one cluster client and one fleet state store
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    config: Arc<OperatorConfig>,
    upgrade: UpgradeManager,
    remediation: RemediationDispatcher,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<OperatorConfig>, clock: Arc<dyn Clock>) -> Self {
        let upgrade = UpgradeManager::new(client.clone(), config.clone(), clock.clone());
        let remediation = RemediationDispatcher::new(client.clone(), config.clone(), clock, upgrade.store());
        Self {
            client,
            config,
            upgrade,
            remediation,
        }
    }

    pub fn upgrade(&self) -> &UpgradeManager {
        &self.upgrade
    }

    pub fn remediation(&self) -> &RemediationDispatcher {
        &self.remediation
    }

    /// One reconcile pass. Errors from either subsystem do not stop the
    /// other; they are joined and returned after the status write.
    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn apply(&self, dc: &DeviceConfig) -> Result<Action> {
        let nodes = self.client.list_nodes(&label_selector(dc)).await?;
        debug!(nodes = nodes.len(), "Nodes selected");

        let mut errors = Vec::new();
        let mut requeue = None;

        match self.upgrade.handle_upgrade(dc, &nodes).await {
            Ok(delay) => requeue = shortest(requeue, delay),
            Err(e) => {
                error!(error = %e, "Driver upgrade pass failed");
                errors.push(e);
            }
        }
        match self.remediation.handle_remediation(dc, &nodes).await {
            Ok(delay) => requeue = shortest(requeue, delay),
            Err(e) => {
                error!(error = %e, "Remediation pass failed");
                errors.push(e);
            }
        }
        if let Err(e) = self.persist_status(dc, &nodes).await {
            error!(error = %e, "Failed to persist node module status");
            errors.push(e);
        }

        if let Some(e) = Error::join(errors) {
            return Err(e);
        }
        Ok(requeue.map_or_else(Action::await_change, Action::requeue))
    }

    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn cleanup(&self, dc: &DeviceConfig) -> Result<Action> {
        info!("DeviceConfig deleted, cleaning up");
        let nodes = self.client.list_nodes(&label_selector(dc)).await?;

        let mut errors = Vec::new();
        if let Err(e) = self.upgrade.handle_delete(dc, &nodes).await {
            errors.push(e);
        }
        if let Err(e) = self.remediation.handle_delete(dc).await {
            errors.push(e);
        }
        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(Action::await_change()),
        }
    }

    /// Merge the loaded module and the upgrade state of every selected node
    /// into `status.nodeModuleStatus`. Nodes no longer selected are removed.
    async fn persist_status(&self, dc: &DeviceConfig, nodes: &[Node]) -> Result<()> {
        let namespace = dc.namespace_or_default();
        let name = dc.name_or_default();
        let store = self.upgrade.store();
        let previous = dc
            .status
            .as_ref()
            .map(|s| s.node_module_status.clone())
            .unwrap_or_default();

        let mut current = BTreeMap::new();
        for node in nodes {
            let node_name = node.name_any();
            let mut status = previous.get(&node_name).cloned().unwrap_or_default();

            match self.client.get_node_modules_config(&node_name).await {
                Ok(Some(nmc)) => {
                    if let Some(module) = nmc.module_status(&namespace, &name) {
                        status.container_image.clone_from(&module.config.container_image);
                        status.kernel_version.clone_from(&module.config.kernel_version);
                        status.last_transition_time = module.last_transition_time.clone().unwrap_or_default();
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node_name, error = %e, "Failed to read NodeModulesConfig"),
            }

            if let Some(entry) = store.entry(&node_name) {
                status.status = entry.phase;
                status.upgrade_start_time = entry.started_at.map(format_timestamp).unwrap_or_default();
                status.boot_id = entry.boot_id.unwrap_or_default();
            }
            current.insert(node_name, status);
        }

        if current == previous {
            return Ok(());
        }

        let mut patch = Map::new();
        for (node_name, status) in &current {
            if previous.get(node_name) != Some(status) {
                patch.insert(node_name.clone(), serde_json::to_value(status)?);
            }
        }
        for node_name in previous.keys().filter(|n| !current.contains_key(*n)) {
            patch.insert(node_name.clone(), Value::Null);
        }

        let mut body = json!({ "nodeModuleStatus": patch });
        if let Some(generation) = dc.metadata.generation {
            body["observedGeneration"] = json!(generation);
        }
        self.client.patch_device_config_status(&namespace, &name, body).await?;
        debug!(changed = patch.len(), "Node module status persisted");
        Ok(())
    }

    fn requeue_delay(&self) -> Duration {
        self.config.requeue_delay()
    }
}

/// `spec.selector` as a label selector string
pub fn label_selector(dc: &DeviceConfig) -> String {
    dc.spec
        .selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn shortest(current: Option<Duration>, next: Option<Duration>) -> Option<Duration> {
    match (current, next) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Shared state handed to every reconcile
pub struct Context {
    pub client: Client,
    pub reconciler: Reconciler,
}

#[instrument(skip_all, fields(device_config = %dc.name_any()))]
pub async fn reconcile(dc: Arc<DeviceConfig>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = dc.namespace_or_default();
    let api: Api<DeviceConfig> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, DEVICE_CONFIG_FINALIZER, dc, |event| async {
        match event {
            FinalizerEvent::Apply(dc) => ctx.reconciler.apply(&dc).await,
            FinalizerEvent::Cleanup(dc) => ctx.reconciler.cleanup(&dc).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey(".metadata.name"),
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::FinalizerError(format!("invalid finalizer name {DEVICE_CONFIG_FINALIZER}"))
        }
    })
}

pub fn error_policy(dc: Arc<DeviceConfig>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.reconciler.requeue_delay();
    error!(
        error = %err,
        device_config = %dc.name_any(),
        retry_in = ?delay,
        "DeviceConfig reconciliation failed"
    );
    Action::requeue(delay)
}

/// Watch DeviceConfigs in `namespace` until SIGINT/SIGTERM
#[instrument(skip(context), fields(namespace = %namespace))]
pub async fn run(namespace: String, context: Arc<Context>) {
    info!("Starting DeviceConfig controller");

    let api: Api<DeviceConfig> = Api::namespaced(context.client.clone(), &namespace);
    Controller::new(api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| {
            let span = tracing::info_span!("device_config_reconciliation_result");
            async move {
                match result {
                    Ok((object, _)) => debug!(device_config = %object.name, "Reconciled"),
                    Err(e) => warn!(error = %e, "Reconciliation error"),
                }
            }
            .instrument(span)
        })
        .await;

    info!("DeviceConfig controller shut down");
}
