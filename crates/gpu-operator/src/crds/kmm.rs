//! Typed view of the KMM `NodeModulesConfig` kind (one object per node).

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "kmm.sigs.x-k8s.io", version = "v1beta1", kind = "NodeModulesConfig")]
#[kube(status = "NodeModulesConfigStatus")]
#[kube(schema = "disabled")]
pub struct NodeModulesConfigSpec {
    #[serde(default)]
    pub modules: Vec<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct NodeModulesConfigStatus {
    #[serde(default)]
    pub modules: Vec<NodeModuleState>,
}

/// Module actually loaded on the node
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct NodeModuleState {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub config: LoadedModuleConfig,

    #[serde(default, rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct LoadedModuleConfig {
    #[serde(default, rename = "containerImage")]
    pub container_image: String,

    #[serde(default, rename = "kernelVersion")]
    pub kernel_version: String,
}

impl NodeModulesConfig {
    /// Status entry for the module owned by DeviceConfig `namespace/name`
    pub fn module_status(&self, namespace: &str, name: &str) -> Option<&NodeModuleState> {
        self.status
            .as_ref()?
            .modules
            .iter()
            .find(|m| m.namespace == namespace && m.name == name)
    }
}
