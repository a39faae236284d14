//! Reboot Coordinator.
//!
//! A node is rebooted by scheduling a privileged pod onto it that enters the
//! host namespaces and runs `reboot`. The pod name is derived from the node
//! name, so at most one exists per node.

use super::worker::NodeWorker;
use crate::config::OperatorConfig;
use crate::crds::{DeviceConfig, UpgradePhase};
use crate::nodes::{self, HOSTNAME_LABEL, NO_SCHEDULE, UPGRADE_TAINT_KEY, UPGRADE_TAINT_VALUE};
use crate::wait::{poll_until, PollSchedule, WaitOutcome};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, SecurityContext, Toleration};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

pub fn reboot_pod_name(node: &str) -> String {
    format!("amd-gpu-operator-{node}-reboot-worker")
}

/// Utility image from the DeviceConfig, else the configured default
pub fn utils_image(dc: &DeviceConfig, config: &OperatorConfig) -> String {
    let image = &dc.spec.common_config.utils_container.image;
    if image.is_empty() {
        config.default_utils_image()
    } else {
        image.clone()
    }
}

/// Privileged pod pinned to `node` that reboots the host
pub fn reboot_pod(dc: &DeviceConfig, node: &str, config: &OperatorConfig) -> Pod {
    let utils = &dc.spec.common_config.utils_container;
    let pull_policy = (!utils.image_pull_policy.is_empty()).then(|| utils.image_pull_policy.clone());

    Pod {
        metadata: ObjectMeta {
            name: Some(reboot_pod_name(node)),
            namespace: Some(dc.namespace_or_default()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(config.images.utils_service_account.clone()),
            host_pid: Some(true),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            node_selector: Some(BTreeMap::from([(
                HOSTNAME_LABEL.to_string(),
                node.to_string(),
            )])),
            image_pull_secrets: utils.image_registry_secret.clone().map(|secret| vec![secret]),
            containers: vec![Container {
                name: "reboot-container".to_string(),
                image: Some(utils_image(dc, config)),
                image_pull_policy: pull_policy,
                command: Some(
                    ["/nsenter", "--all", "--target=1", "--", "sudo", "reboot"]
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                ),
                stdin: Some(true),
                tty: Some(true),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            tolerations: Some(vec![Toleration {
                key: Some(UPGRADE_TAINT_KEY.to_string()),
                value: Some(UPGRADE_TAINT_VALUE.to_string()),
                operator: Some("Equal".to_string()),
                effect: Some(NO_SCHEDULE.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

impl NodeWorker {
    fn reboot_namespace(&self) -> String {
        self.dc.namespace_or_default()
    }

    /// New driver reported loaded by KMM for this DeviceConfig
    async fn driver_loaded(&self) -> bool {
        let namespace = self.reboot_namespace();
        let name = self.dc.name_or_default();
        match self.client.get_node_modules_config(&self.node).await {
            Ok(Some(nmc)) => nmc
                .module_status(&namespace, &name)
                .is_some_and(|m| m.config.container_image.ends_with(&self.version)),
            Ok(None) => false,
            Err(e) => {
                debug!(node = %self.node, error = %e, "NodeModulesConfig not readable yet");
                false
            }
        }
    }

    /// Node went down or came back with a new boot id
    async fn reboot_started(&self) -> bool {
        let node = match self.client.get_node(&self.node).await {
            Ok(node) => node,
            Err(e) => {
                debug!(node = %self.node, error = %e, "Node not readable while waiting for reboot");
                return false;
            }
        };
        let live = nodes::boot_id(&node).unwrap_or_default();
        if self.store.boot_id(&self.node).as_deref() != Some(live) {
            info!(node = %self.node, "Node has rebooted");
            self.store.set_boot_id(&self.node, live);
            return true;
        }
        if !nodes::is_ready(&node) {
            info!(node = %self.node, "Node has moved to NotReady");
            return true;
        }
        false
    }

    async fn node_ready(&self) -> bool {
        match self.client.get_node(&self.node).await {
            Ok(node) => nodes::is_ready(&node),
            Err(e) => {
                debug!(node = %self.node, error = %e, "Node not readable while waiting for recovery");
                false
            }
        }
    }

    /// Relabel, wait for the new driver, reboot, and wait for the node to
    /// return before handing it back as `InProgress`.
    pub async fn reboot(&self) {
        let namespace = self.reboot_namespace();
        let pod_name = reboot_pod_name(&self.node);

        if let Err(e) = self.client.delete_pod(&namespace, &pod_name, None).await {
            error!(node = %self.node, error = %e, "Failed to delete stale reboot pod");
            self.transition(UpgradePhase::Started, UpgradePhase::RebootFailed);
            return;
        }

        if let Err(e) = self.update_version_label().await {
            error!(node = %self.node, error = %e, "Version label update failed");
            self.transition(UpgradePhase::Started, UpgradePhase::Failed);
            return;
        }

        let schedule = PollSchedule::from(self.config.driver_ready_poll);
        match poll_until(schedule, &self.token, move || self.driver_loaded()).await {
            WaitOutcome::Cancelled => return,
            WaitOutcome::TimedOut => {
                warn!(node = %self.node, "New driver not reported loaded, rebooting anyway");
            }
            WaitOutcome::Satisfied => debug!(node = %self.node, "New driver reported loaded"),
        }

        let boot_id = match self.client.get_node(&self.node).await {
            Ok(node) => nodes::boot_id(&node).unwrap_or_default().to_string(),
            Err(e) => {
                error!(node = %self.node, error = %e, "Failed to read node before reboot");
                self.transition(UpgradePhase::Started, UpgradePhase::RebootFailed);
                return;
            }
        };
        self.store.set_boot_id(&self.node, &boot_id);

        let pod = reboot_pod(&self.dc, &self.node, &self.config);
        if let Err(e) = self.client.create_pod(&namespace, &pod).await {
            error!(node = %self.node, error = %e, "Failed to create reboot pod");
            self.transition(UpgradePhase::Started, UpgradePhase::RebootFailed);
            return;
        }
        info!(node = %self.node, pod = %pod_name, "Reboot pod created");

        let schedule = PollSchedule::from(self.config.reboot_start_poll);
        match poll_until(schedule, &self.token, move || self.reboot_started()).await {
            WaitOutcome::Cancelled => return,
            WaitOutcome::TimedOut => warn!(node = %self.node, "Node did not report going down"),
            WaitOutcome::Satisfied => {}
        }

        if !self.transition(UpgradePhase::Started, UpgradePhase::RebootInProgress) {
            return;
        }
        self.finish_reboot(false).await;
    }

    /// Remove the reboot pod and move the node from `RebootInProgress` to
    /// `InProgress`. Without `force`, waits for the node to report Ready
    /// first; the pod is removed even when that wait runs out.
    pub async fn finish_reboot(&self, force: bool) {
        let namespace = self.reboot_namespace();
        let pod_name = reboot_pod_name(&self.node);

        match self.client.get_pod(&namespace, &pod_name).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                warn!(node = %self.node, error = %e, "Failed to read reboot pod");
                return;
            }
        }

        if !force {
            let schedule = PollSchedule::from(self.config.reboot_recovery_poll);
            match poll_until(schedule, &self.token, move || self.node_ready()).await {
                WaitOutcome::Satisfied => info!(node = %self.node, "Node is Ready after reboot"),
                WaitOutcome::Cancelled => return,
                WaitOutcome::TimedOut => {
                    warn!(node = %self.node, "Node did not return to Ready in time, removing reboot pod anyway");
                }
            }
        }

        if let Err(e) = self.client.delete_pod(&namespace, &pod_name, Some(0)).await {
            error!(node = %self.node, error = %e, "Failed to delete reboot pod");
        }
        self.transition(UpgradePhase::RebootInProgress, UpgradePhase::InProgress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::crds::kmm::{LoadedModuleConfig, NodeModuleState, NodeModulesConfigStatus};
    use crate::crds::{NodeModulesConfig, UpgradePolicySpec};
    use crate::nodes::fixtures::{condition, node};
    use crate::upgrade::state::FleetStateStore;
    use crate::upgrade::worker::fixtures::device_config;
    use k8s_openapi::api::core::v1::LocalObjectReference;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn nmc(node: &str, image: &str) -> NodeModulesConfig {
        let mut nmc = NodeModulesConfig::new(node, Default::default());
        nmc.status = Some(NodeModulesConfigStatus {
            modules: vec![NodeModuleState {
                name: "dc".to_string(),
                namespace: "gpu".to_string(),
                config: LoadedModuleConfig {
                    container_image: image.to_string(),
                    kernel_version: "6.8.0".to_string(),
                },
                last_transition_time: None,
            }],
        });
        nmc
    }

    fn worker(fake: &Arc<FakeCluster>) -> NodeWorker {
        let store = Arc::new(FleetStateStore::new());
        store.set_phase("n1", UpgradePhase::Started);
        NodeWorker {
            client: fake.clone(),
            store,
            config: Arc::new(OperatorConfig::default()),
            dc: Arc::new(device_config("6.2", UpgradePolicySpec::default())),
            node: "n1".to_string(),
            version: "6.2".to_string(),
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn reboot_pod_is_pinned_and_privileged() {
        let mut dc = device_config("6.2", UpgradePolicySpec::default());
        dc.spec.common_config.utils_container.image_pull_policy = "Always".to_string();
        dc.spec.common_config.utils_container.image_registry_secret = Some(LocalObjectReference {
            name: "regcred".to_string(),
        });
        let config = OperatorConfig::default();

        let pod = reboot_pod(&dc, "n1", &config);
        let spec = pod.spec.unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("amd-gpu-operator-n1-reboot-worker"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("gpu"));
        assert_eq!(spec.node_selector.unwrap()[HOSTNAME_LABEL], "n1");
        assert_eq!(spec.host_pid, Some(true));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("amd-gpu-operator-utils-container"));
        assert_eq!(spec.image_pull_secrets.unwrap()[0].name, "regcred");
        assert_eq!(spec.tolerations.unwrap()[0].key.as_deref(), Some(UPGRADE_TAINT_KEY));

        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("docker.io/rocm/gpu-operator-utils:latest"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.command.as_ref().unwrap().join(" "),
            "/nsenter --all --target=1 -- sudo reboot"
        );
        assert_eq!(container.security_context.as_ref().unwrap().privileged, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn full_reboot_cycle_ends_in_progress() {
        let fake = Arc::new(FakeCluster::with_nodes(vec![node("n1")]));
        fake.state()
            .node_modules
            .insert("n1".to_string(), nmc("n1", "registry/amdgpu:ubuntu-22.04-6.2"));
        let w = worker(&fake);

        // Simulate the host going down a little after the pod lands, then
        // coming back with a new boot id.
        let cluster = fake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut n1 = cluster.node("n1");
            n1.status.as_mut().unwrap().conditions = Some(vec![condition("Ready", "False")]);
            cluster.put_node(n1);
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut n1 = cluster.node("n1");
            let status = n1.status.as_mut().unwrap();
            status.conditions = Some(vec![condition("Ready", "True")]);
            status.node_info.as_mut().unwrap().boot_id = "n1-boot-2".to_string();
            cluster.put_node(n1);
        });

        w.reboot().await;

        assert_eq!(w.store.phase("n1"), UpgradePhase::InProgress);
        assert!(!fake.has_pod("gpu", "amd-gpu-operator-n1-reboot-worker"));
        assert_eq!(w.store.boot_id("n1").as_deref(), Some("n1-boot-1"));
        let log = fake.log();
        assert!(log.contains(&"create pod gpu/amd-gpu-operator-n1-reboot-worker".to_string()));
        assert!(log.contains(&"delete pod gpu/amd-gpu-operator-n1-reboot-worker".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_creation_failure_is_reboot_failed() {
        let fake = Arc::new(FakeCluster::with_nodes(vec![node("n1")]));
        fake.state()
            .node_modules
            .insert("n1".to_string(), nmc("n1", "registry/amdgpu:ubuntu-22.04-6.2"));
        fake.fail("create_pod");
        let w = worker(&fake);

        w.reboot().await;

        assert_eq!(w.store.phase("n1"), UpgradePhase::RebootFailed);
    }

    #[tokio::test]
    async fn forced_finish_deletes_without_waiting() {
        let fake = Arc::new(FakeCluster::with_nodes(vec![node("n1")]));
        let w = worker(&fake);
        w.store.set_phase("n1", UpgradePhase::RebootInProgress);
        fake.put_pod(reboot_pod(&w.dc, "n1", &w.config));

        w.finish_reboot(true).await;

        assert!(!fake.has_pod("gpu", "amd-gpu-operator-n1-reboot-worker"));
        assert_eq!(w.store.phase("n1"), UpgradePhase::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn node_that_never_returns_still_loses_its_reboot_pod() {
        let mut n1 = node("n1");
        n1.status.as_mut().unwrap().conditions = Some(vec![condition("Ready", "False")]);
        let fake = Arc::new(FakeCluster::with_nodes(vec![n1]));
        let w = worker(&fake);
        w.store.set_phase("n1", UpgradePhase::RebootInProgress);
        fake.put_pod(reboot_pod(&w.dc, "n1", &w.config));

        w.finish_reboot(false).await;

        assert!(!fake.has_pod("gpu", "amd-gpu-operator-n1-reboot-worker"));
        assert_eq!(w.store.phase("n1"), UpgradePhase::InProgress);
    }

    #[tokio::test]
    async fn late_finish_keeps_a_timed_out_node_failed() {
        let fake = Arc::new(FakeCluster::with_nodes(vec![node("n1")]));
        let w = worker(&fake);
        w.store.set_phase("n1", UpgradePhase::Failed);
        fake.put_pod(reboot_pod(&w.dc, "n1", &w.config));

        w.finish_reboot(true).await;

        assert!(!fake.has_pod("gpu", "amd-gpu-operator-n1-reboot-worker"));
        assert_eq!(w.store.phase("n1"), UpgradePhase::Failed);
    }

    #[tokio::test]
    async fn finish_without_pod_is_a_no_op() {
        let fake = Arc::new(FakeCluster::with_nodes(vec![node("n1")]));
        let w = worker(&fake);

        w.finish_reboot(false).await;

        assert_eq!(w.store.phase("n1"), UpgradePhase::Started);
    }
}
