//! Typed views of the Argo `Workflow` and `WorkflowTemplate` kinds.
//!
//! Only the fields the dispatcher reads or writes are typed; everything else
//! round-trips through the `extra` maps untouched.

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Argo node type of a suspend step
pub const SUSPEND_NODE_TYPE: &str = "Suspend";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "argoproj.io", version = "v1alpha1", kind = "Workflow")]
#[kube(namespaced)]
#[kube(status = "WorkflowStatus")]
#[kube(schema = "disabled")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entrypoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,

    #[serde(default, rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, rename = "ttlStrategy", skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "argoproj.io", version = "v1alpha1", kind = "WorkflowTemplate")]
#[kube(namespaced)]
#[kube(schema = "disabled")]
pub struct WorkflowTemplateSpec {
    #[serde(flatten)]
    pub workflow: WorkflowSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Parameter {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Parameter {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.into()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct TtlStrategy {
    #[serde(default, rename = "secondsAfterCompletion", skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Template {
    pub name: String,

    #[serde(default, rename = "nodeSelector", skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkflowPhase {
    /// Not yet picked up by the workflow controller
    #[default]
    #[serde(rename = "Pending", alias = "")]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, WorkflowNodeStatus>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct WorkflowNodeStatus {
    #[serde(default, rename = "displayName")]
    pub display_name: String,

    #[serde(default, rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub phase: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Workflow {
    pub fn phase(&self) -> WorkflowPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Suspend steps currently holding the workflow, as `(node id, display name)`
    pub fn suspended_steps(&self) -> Vec<(String, String)> {
        self.status
            .iter()
            .flat_map(|status| status.nodes.iter())
            .filter(|(_, node)| node.node_type == SUSPEND_NODE_TYPE && node.phase == "Running")
            .map(|(id, node)| (id.clone(), node.display_name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Workflow",
            "metadata": {"name": "n1-default-template-abcde", "namespace": "gpu"},
            "spec": {
                "entrypoint": "inbuilt",
                "podGC": {"strategy": "OnPodSuccess"},
                "templates": [{"name": "suspend", "suspend": {}}]
            },
            "status": {
                "phase": "Running",
                "startedAt": "2025-01-01T00:00:00Z",
                "nodes": {
                    "n1-x-1": {"displayName": "suspend", "type": "Suspend", "phase": "Running"},
                    "n1-x-2": {"displayName": "drain", "type": "Pod", "phase": "Succeeded"}
                }
            }
        });

        let wf: Workflow = serde_json::from_value(raw).unwrap();
        assert_eq!(wf.phase(), WorkflowPhase::Running);
        assert_eq!(
            wf.suspended_steps(),
            vec![("n1-x-1".to_string(), "suspend".to_string())]
        );

        let back = serde_json::to_value(&wf).unwrap();
        assert_eq!(back["spec"]["podGC"]["strategy"], "OnPodSuccess");
        assert_eq!(back["spec"]["templates"][0]["suspend"], serde_json::json!({}));
        assert_eq!(back["status"]["startedAt"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn empty_phase_reads_as_pending() {
        let status: WorkflowStatus = serde_json::from_value(serde_json::json!({"phase": ""})).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Pending);
    }
}
