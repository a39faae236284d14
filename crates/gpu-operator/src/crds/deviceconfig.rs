//! `DeviceConfig` Custom Resource Definition
//!
//! Only the fields consumed by driver upgrade orchestration and node
//! remediation are modelled here.

use k8s_openapi::api::core::v1::{LocalObjectReference, Taint};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding node cleanup on deletion
pub const DEVICE_CONFIG_FINALIZER: &str = "amd.node.kubernetes.io/deviceconfig-finalizer";

/// Suffix of the operator-created condition mapping ConfigMap
pub const DEFAULT_MAPPING_CONFIG_MAP_SUFFIX: &str = "default-conditional-workflow-mappings";

fn default_max_parallel_upgrades() -> u32 {
    1
}

fn default_max_unavailable_nodes() -> IntOrString {
    IntOrString::String("25%".to_string())
}

fn default_reboot_required() -> bool {
    true
}

fn default_grace_period_seconds() -> i64 {
    -1
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "amd.com", version = "v1alpha1", kind = "DeviceConfig")]
#[kube(namespaced)]
#[kube(status = "DeviceConfigStatus")]
#[kube(printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver.version"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct DeviceConfigSpec {
    #[serde(default)]
    pub driver: DriverSpec,

    #[serde(default, rename = "remediationWorkflow")]
    pub remediation_workflow: RemediationWorkflowSpec,

    #[serde(default, rename = "commonConfig")]
    pub common_config: CommonConfigSpec,

    /// Node label selector choosing the nodes this DeviceConfig manages
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct DriverSpec {
    /// Install and manage the out-of-tree driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    /// Desired driver version; empty selects the OS default
    #[serde(default)]
    pub version: String,

    #[serde(default, rename = "upgradePolicy", skip_serializing_if = "Option::is_none")]
    pub upgrade_policy: Option<UpgradePolicySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct UpgradePolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    /// Nodes upgraded at once; 0 means unlimited
    #[serde(default = "default_max_parallel_upgrades", rename = "maxParallelUpgrades")]
    pub max_parallel_upgrades: u32,

    /// Count or percentage of nodes allowed to sit in a failed upgrade state
    #[serde(default = "default_max_unavailable_nodes", rename = "maxUnavailableNodes")]
    pub max_unavailable_nodes: IntOrString,

    #[serde(default, rename = "nodeDrainPolicy", skip_serializing_if = "Option::is_none")]
    pub node_drain_policy: Option<DrainSpec>,

    #[serde(default, rename = "podDeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub pod_deletion_policy: Option<PodDeletionSpec>,

    #[serde(default = "default_reboot_required", rename = "rebootRequired")]
    pub reboot_required: bool,
}

impl Default for UpgradePolicySpec {
    fn default() -> Self {
        Self {
            enable: None,
            max_parallel_upgrades: default_max_parallel_upgrades(),
            max_unavailable_nodes: default_max_unavailable_nodes(),
            node_drain_policy: None,
            pod_deletion_policy: None,
            reboot_required: default_reboot_required(),
        }
    }
}

/// Evict pods from a node before disruptive maintenance
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct DrainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,

    /// 0 waits indefinitely
    #[serde(default, rename = "timeoutSeconds")]
    pub timeout_seconds: i64,

    /// -1 uses each pod's own grace period
    #[serde(default = "default_grace_period_seconds", rename = "gracePeriodSeconds")]
    pub grace_period_seconds: i64,

    #[serde(default, rename = "ignoreDaemonSets", skip_serializing_if = "Option::is_none")]
    pub ignore_daemon_sets: Option<bool>,

    #[serde(default, rename = "ignoreNamespaces", skip_serializing_if = "Vec::is_empty")]
    pub ignore_namespaces: Vec<String>,
}

/// Delete (rather than evict) pods from a node
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PodDeletionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,

    #[serde(default, rename = "timeoutSeconds")]
    pub timeout_seconds: i64,

    #[serde(default = "default_grace_period_seconds", rename = "gracePeriodSeconds")]
    pub grace_period_seconds: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct RemediationWorkflowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    /// User ConfigMap holding the condition to workflow mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<LocalObjectReference>,

    /// Go-style duration, e.g. `24h`
    #[serde(default, rename = "ttlForFailedWorkflows")]
    pub ttl_for_failed_workflows: String,

    #[serde(default, rename = "testerImage")]
    pub tester_image: String,

    #[serde(default, rename = "maxParallelWorkflows")]
    pub max_parallel_workflows: u32,

    /// Replace the default `amd-gpu-unhealthy=<condition>:NoSchedule` taint
    #[serde(default, rename = "nodeRemediationTaints", skip_serializing_if = "Vec::is_empty")]
    pub node_remediation_taints: Vec<Taint>,

    #[serde(default, rename = "nodeRemediationLabels", skip_serializing_if = "BTreeMap::is_empty")]
    pub node_remediation_labels: BTreeMap<String, String>,

    #[serde(default, rename = "nodeDrainPolicy", skip_serializing_if = "Option::is_none")]
    pub node_drain_policy: Option<DrainSpec>,

    /// Start workflows without waiting for a manual resume; defaults to true
    #[serde(default, rename = "autoStartWorkflow", skip_serializing_if = "Option::is_none")]
    pub auto_start_workflow: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct CommonConfigSpec {
    #[serde(default, rename = "initContainerImage")]
    pub init_container_image: String,

    #[serde(default, rename = "utilsContainer")]
    pub utils_container: UtilsContainerSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct UtilsContainerSpec {
    #[serde(default)]
    pub image: String,

    #[serde(default, rename = "imagePullPolicy")]
    pub image_pull_policy: String,

    #[serde(default, rename = "imageRegistrySecret", skip_serializing_if = "Option::is_none")]
    pub image_registry_secret: Option<LocalObjectReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct DeviceConfigStatus {
    /// Per-node driver module and upgrade state
    #[serde(default, rename = "nodeModuleStatus")]
    pub node_module_status: BTreeMap<String, ModuleStatus>,

    #[serde(default, rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ModuleStatus {
    #[serde(default, rename = "containerImage")]
    pub container_image: String,

    #[serde(default, rename = "kernelVersion")]
    pub kernel_version: String,

    #[serde(default, rename = "lastTransitionTime")]
    pub last_transition_time: String,

    #[serde(default)]
    pub status: UpgradePhase,

    /// `YYYY-MM-DD HH:MM:SS UTC`
    #[serde(default, rename = "upgradeStartTime")]
    pub upgrade_start_time: String,

    #[serde(default, rename = "bootId")]
    pub boot_id: String,
}

/// Driver upgrade phase of one node
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum UpgradePhase {
    #[default]
    #[serde(rename = "")]
    Empty,
    #[serde(rename = "Upgrade-Not-Started")]
    NotStarted,
    #[serde(rename = "Upgrade-Started")]
    Started,
    #[serde(rename = "Install-In-Progress")]
    InstallInProgress,
    #[serde(rename = "Install-Complete")]
    InstallComplete,
    #[serde(rename = "Upgrade-In-Progress")]
    InProgress,
    #[serde(rename = "Upgrade-Complete")]
    Complete,
    #[serde(rename = "Upgrade-Failed")]
    Failed,
    #[serde(rename = "Cordon-Failed")]
    CordonFailed,
    #[serde(rename = "Uncordon-Failed")]
    UncordonFailed,
    #[serde(rename = "Drain-Failed")]
    DrainFailed,
    #[serde(rename = "Reboot-In-Progress")]
    RebootInProgress,
    #[serde(rename = "Reboot-Failed")]
    RebootFailed,
}

impl UpgradePhase {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            UpgradePhase::Failed
                | UpgradePhase::CordonFailed
                | UpgradePhase::UncordonFailed
                | UpgradePhase::DrainFailed
                | UpgradePhase::RebootFailed
        )
    }

    /// Phases counted against `maxParallelUpgrades`
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            UpgradePhase::Started | UpgradePhase::InProgress | UpgradePhase::RebootInProgress
        )
    }

    pub fn is_complete(self) -> bool {
        matches!(self, UpgradePhase::Complete | UpgradePhase::InstallComplete)
    }

    /// Phases subject to the upgrade timeout
    pub fn is_timeout_tracked(self) -> bool {
        self.is_in_flight() || (self.is_failure() && self != UpgradePhase::Failed)
    }

    /// Phases during which no remediation workflow may start on the node
    pub fn blocks_remediation(self) -> bool {
        matches!(
            self,
            UpgradePhase::NotStarted
                | UpgradePhase::Started
                | UpgradePhase::InstallInProgress
                | UpgradePhase::InProgress
                | UpgradePhase::RebootInProgress
        )
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            UpgradePhase::Empty => "Empty",
            UpgradePhase::NotStarted => "NotStarted",
            UpgradePhase::Started => "Started",
            UpgradePhase::InstallInProgress => "InstallInProgress",
            UpgradePhase::InstallComplete => "InstallComplete",
            UpgradePhase::InProgress => "InProgress",
            UpgradePhase::Complete => "Complete",
            UpgradePhase::Failed => "Failed",
            UpgradePhase::CordonFailed => "CordonFailed",
            UpgradePhase::UncordonFailed => "UncordonFailed",
            UpgradePhase::DrainFailed => "DrainFailed",
            UpgradePhase::RebootInProgress => "RebootInProgress",
            UpgradePhase::RebootFailed => "RebootFailed",
        };
        f.write_str(text)
    }
}

impl DeviceConfig {
    /// `namespace/name`, used to scope in-flight workers and cached spec snapshots
    pub fn scope_key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    pub fn namespace_or_default(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_else(|| "default".to_string())
    }

    pub fn name_or_default(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Upgrade policy when upgrades are enabled, `None` otherwise
    pub fn active_upgrade_policy(&self) -> Option<&UpgradePolicySpec> {
        self.spec
            .driver
            .upgrade_policy
            .as_ref()
            .filter(|policy| policy.enable.unwrap_or(false))
    }

    pub fn remediation_enabled(&self) -> bool {
        self.spec.remediation_workflow.enable.unwrap_or(false)
    }

    /// Node label carrying the driver version KMM should load
    pub fn version_label_key(&self) -> String {
        format!(
            "kmm.node.kubernetes.io/version-module.{}.{}",
            self.namespace_or_default(),
            self.name_or_default()
        )
    }

    /// ConfigMap holding the condition mappings, and whether the user supplied it
    pub fn mapping_config_map(&self) -> (String, bool) {
        match &self.spec.remediation_workflow.config {
            Some(reference) => (reference.name.clone(), true),
            None => (
                format!("{}-{DEFAULT_MAPPING_CONFIG_MAP_SUFFIX}", self.name_or_default()),
                false,
            ),
        }
    }

    pub fn persisted_node_status(&self, node: &str) -> Option<&ModuleStatus> {
        self.status
            .as_ref()
            .and_then(|status| status.node_module_status.get(node))
    }
}
