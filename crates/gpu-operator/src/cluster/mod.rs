//! Cluster access seam.
//!
//! [`ClusterClient`] is the only way the upgrade orchestrator and the
//! remediation dispatcher talk to the API server. [`KubeClusterClient`]
//! backs it with a `kube::Client`; tests substitute a mock or an in-memory
//! fake.

use crate::crds::{
    DeviceConfig, NodeModulesConfig, RemediationWorkflowStatus, Workflow, WorkflowTemplate,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, ServiceAccount};
use kube::api::{
    Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
pub mod fake;
pub mod retry;

pub use retry::{retry_on_conflict, update_node};

/// Field manager recorded on patches
pub const FIELD_MANAGER: &str = "gpu-operator";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // ======================================================================
    // Nodes
    // ======================================================================

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    /// Full replace guarded by `resourceVersion`; a stale object yields 409.
    async fn replace_node(&self, node: &Node) -> Result<Node>;
    async fn get_node_modules_config(&self, node_name: &str) -> Result<Option<NodeModulesConfig>>;

    // ======================================================================
    // Pods
    // ======================================================================

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;
    /// Missing pods are not an error.
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<u32>) -> Result<()>;
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<u32>) -> Result<()>;

    // ======================================================================
    // ConfigMaps and service accounts
    // ======================================================================

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap>;
    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap>;
    /// Missing ConfigMaps are not an error.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
    async fn list_service_accounts(&self, namespace: &str) -> Result<Vec<ServiceAccount>>;

    // ======================================================================
    // Workflow engine
    // ======================================================================

    async fn get_workflow_template(&self, namespace: &str, name: &str) -> Result<Option<WorkflowTemplate>>;
    async fn create_workflow_template(&self, namespace: &str, template: &WorkflowTemplate) -> Result<WorkflowTemplate>;
    async fn list_workflows(&self, namespace: &str) -> Result<Vec<Workflow>>;
    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow>;
    /// Missing workflows are not an error.
    async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()>;
    /// Mark the given status nodes `Succeeded`, releasing suspend steps.
    async fn complete_workflow_nodes(
        &self,
        namespace: &str,
        name: &str,
        node_ids: Vec<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<()>;

    // ======================================================================
    // Operator resources
    // ======================================================================

    async fn get_remediation_status(&self, namespace: &str, name: &str) -> Result<Option<RemediationWorkflowStatus>>;
    async fn create_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus>;
    async fn replace_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus>;
    /// JSON merge patch against the DeviceConfig status subresource
    async fn patch_device_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;
}

/// [`ClusterClient`] over a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn delete_params(grace_period_seconds: Option<u32>) -> DeleteParams {
        DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        }
    }
}

/// Map a 404 on delete to success
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or(crate::Error::MissingObjectKey(".metadata.name"))?;
        Ok(api.replace(name, &PostParams::default(), node).await?)
    }

    async fn get_node_modules_config(&self, node_name: &str) -> Result<Option<NodeModulesConfig>> {
        let api: Api<NodeModulesConfig> = Api::all(self.client.clone());
        Ok(api.get_opt(node_name).await?)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<u32>) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &Self::delete_params(grace_period_seconds)).await)
    }

    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: Option<u32>) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(Self::delete_params(grace_period_seconds)),
            post_options: PostParams::default(),
        };
        ignore_not_found(api.evict(name, &params).await)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map
            .metadata
            .name
            .as_deref()
            .ok_or(crate::Error::MissingObjectKey(".metadata.name"))?;
        Ok(api.replace(name, &PostParams::default(), config_map).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_service_accounts(&self, namespace: &str) -> Result<Vec<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_workflow_template(&self, namespace: &str, name: &str) -> Result<Option<WorkflowTemplate>> {
        let api: Api<WorkflowTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_workflow_template(&self, namespace: &str, template: &WorkflowTemplate) -> Result<WorkflowTemplate> {
        let api: Api<WorkflowTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), template).await?)
    }

    async fn list_workflows(&self, namespace: &str) -> Result<Vec<Workflow>> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), workflow).await?)
    }

    async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn complete_workflow_nodes(
        &self,
        namespace: &str,
        name: &str,
        node_ids: Vec<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        let finished = finished_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let nodes: serde_json::Map<String, serde_json::Value> = node_ids
            .into_iter()
            .map(|id| (id, json!({"phase": "Succeeded", "finishedAt": finished})))
            .collect();
        let patch = json!({"status": {"nodes": nodes}});
        debug!(workflow = %name, "Patching suspended workflow nodes");
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_remediation_status(&self, namespace: &str, name: &str) -> Result<Option<RemediationWorkflowStatus>> {
        let api: Api<RemediationWorkflowStatus> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus> {
        let api: Api<RemediationWorkflowStatus> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), status).await?)
    }

    async fn replace_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus> {
        let api: Api<RemediationWorkflowStatus> = Api::namespaced(self.client.clone(), namespace);
        let name = status
            .metadata
            .name
            .as_deref()
            .ok_or(crate::Error::MissingObjectKey(".metadata.name"))?;
        let body = serde_json::to_vec(status)?;
        Ok(api.replace_status(name, &PostParams::default(), body).await?)
    }

    async fn patch_device_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let api: Api<DeviceConfig> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"status": status});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
