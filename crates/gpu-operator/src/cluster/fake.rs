//! In-memory cluster used by the multi-node scenario tests.

use super::ClusterClient;
use crate::crds::{
    NodeModulesConfig, RemediationWorkflowStatus, Workflow, WorkflowPhase, WorkflowTemplate,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, ServiceAccount};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct FakeState {
    pub nodes: BTreeMap<String, Node>,
    pub pods: BTreeMap<(String, String), Pod>,
    pub node_modules: BTreeMap<String, NodeModulesConfig>,
    pub config_maps: BTreeMap<(String, String), ConfigMap>,
    pub service_accounts: Vec<ServiceAccount>,
    pub workflow_templates: BTreeMap<(String, String), WorkflowTemplate>,
    pub workflows: BTreeMap<(String, String), Workflow>,
    pub remediation_status: BTreeMap<(String, String), RemediationWorkflowStatus>,
    pub device_config_status: BTreeMap<(String, String), serde_json::Value>,
    /// Operation names that fail with a 500
    pub failing: HashSet<&'static str>,
    /// Pods whose eviction is refused with a 429
    pub eviction_blocked: HashSet<String>,
    /// Conflicts returned by the next `replace_node` calls
    pub pending_node_conflicts: u32,
    /// Mutating calls, e.g. `evict gpu/exporter`
    pub log: Vec<String>,
    generated: u32,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn bump_version(meta: &mut kube::api::ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let fake = Self::new();
        for node in nodes {
            fake.put_node(node);
        }
        fake
    }

    pub fn put_node(&self, node: Node) {
        self.state().nodes.insert(node.name_any(), node);
    }

    pub fn node(&self, name: &str) -> Node {
        self.state().nodes[name].clone()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.state().nodes.values().cloned().collect()
    }

    pub fn put_pod(&self, pod: Pod) {
        let ns = pod.namespace().unwrap_or_default();
        self.state().pods.insert(key(&ns, &pod.name_any()), pod);
    }

    pub fn has_pod(&self, namespace: &str, name: &str) -> bool {
        self.state().pods.contains_key(&key(namespace, name))
    }

    pub fn put_workflow(&self, workflow: Workflow) {
        let ns = workflow.namespace().unwrap_or_default();
        self.state()
            .workflows
            .insert(key(&ns, &workflow.name_any()), workflow);
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.state().workflows.values().cloned().collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn fail(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    fn check(state: &FakeState, operation: &'static str) -> Result<()> {
        if state.failing.contains(operation) {
            return Err(Error::api(500, "InternalError", format!("{operation} failed")));
        }
        Ok(())
    }
}

fn not_found(what: &str) -> Error {
    Error::api(404, "NotFound", format!("{what} not found"))
}

fn already_exists(what: &str) -> Error {
    Error::api(409, "AlreadyExists", format!("{what} already exists"))
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self, _label_selector: &str) -> Result<Vec<Node>> {
        Ok(self.nodes())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let state = self.state();
        Self::check(&state, "get_node")?;
        state.nodes.get(name).cloned().ok_or_else(|| not_found(name))
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let mut state = self.state();
        Self::check(&state, "replace_node")?;
        if state.pending_node_conflicts > 0 {
            state.pending_node_conflicts -= 1;
            return Err(Error::api(409, "Conflict", "the object has been modified"));
        }
        let name = node.name_any();
        let current = state.nodes.get(&name).ok_or_else(|| not_found(&name))?;
        if current.metadata.resource_version != node.metadata.resource_version {
            return Err(Error::api(409, "Conflict", "the object has been modified"));
        }
        let mut stored = node.clone();
        bump_version(&mut stored.metadata);
        state.log.push(format!("replace node/{name}"));
        state.nodes.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_node_modules_config(&self, node_name: &str) -> Result<Option<NodeModulesConfig>> {
        Ok(self.state().node_modules.get(node_name).cloned())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let state = self.state();
        Self::check(&state, "list_pods_on_node")?;
        Ok(state
            .pods
            .values()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.state().pods.get(&key(namespace, name)).cloned())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut state = self.state();
        Self::check(&state, "create_pod")?;
        let name = pod.name_any();
        if state.pods.contains_key(&key(namespace, &name)) {
            return Err(already_exists(&name));
        }
        state.log.push(format!("create pod {namespace}/{name}"));
        state.pods.insert(key(namespace, &name), pod.clone());
        Ok(pod.clone())
    }

    async fn delete_pod(&self, namespace: &str, name: &str, _grace: Option<u32>) -> Result<()> {
        let mut state = self.state();
        Self::check(&state, "delete_pod")?;
        if state.pods.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete pod {namespace}/{name}"));
        }
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, _grace: Option<u32>) -> Result<()> {
        let mut state = self.state();
        Self::check(&state, "evict_pod")?;
        if state.eviction_blocked.contains(name) {
            return Err(Error::api(429, "TooManyRequests", "disruption budget"));
        }
        if state.pods.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("evict {namespace}/{name}"));
        }
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.state().config_maps.get(&key(namespace, name)).cloned())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let mut state = self.state();
        let name = config_map.name_any();
        if state.config_maps.contains_key(&key(namespace, &name)) {
            return Err(already_exists(&name));
        }
        let mut stored = config_map.clone();
        bump_version(&mut stored.metadata);
        state.log.push(format!("create configmap {namespace}/{name}"));
        state.config_maps.insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let mut state = self.state();
        let name = config_map.name_any();
        let current = state
            .config_maps
            .get(&key(namespace, &name))
            .ok_or_else(|| not_found(&name))?;
        if current.metadata.resource_version != config_map.metadata.resource_version {
            return Err(Error::api(409, "Conflict", "the object has been modified"));
        }
        let mut stored = config_map.clone();
        bump_version(&mut stored.metadata);
        state.config_maps.insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.config_maps.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete configmap {namespace}/{name}"));
        }
        Ok(())
    }

    async fn list_service_accounts(&self, _namespace: &str) -> Result<Vec<ServiceAccount>> {
        Ok(self.state().service_accounts.clone())
    }

    async fn get_workflow_template(&self, namespace: &str, name: &str) -> Result<Option<WorkflowTemplate>> {
        Ok(self
            .state()
            .workflow_templates
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_workflow_template(&self, namespace: &str, template: &WorkflowTemplate) -> Result<WorkflowTemplate> {
        let mut state = self.state();
        let name = template.name_any();
        if state.workflow_templates.contains_key(&key(namespace, &name)) {
            return Err(already_exists(&name));
        }
        state.log.push(format!("create workflowtemplate {namespace}/{name}"));
        state
            .workflow_templates
            .insert(key(namespace, &name), template.clone());
        Ok(template.clone())
    }

    async fn list_workflows(&self, namespace: &str) -> Result<Vec<Workflow>> {
        Ok(self
            .state()
            .workflows
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, wf)| wf.clone())
            .collect())
    }

    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow> {
        let mut state = self.state();
        Self::check(&state, "create_workflow")?;
        state.generated += 1;
        let mut stored = workflow.clone();
        let name = match (&workflow.metadata.name, &workflow.metadata.generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => format!("{prefix}{:05}", state.generated),
            _ => return Err(Error::MissingObjectKey(".metadata.name")),
        };
        stored.metadata.name = Some(name.clone());
        stored.metadata.namespace = Some(namespace.to_string());
        state.log.push(format!("create workflow {namespace}/{name}"));
        state.workflows.insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.workflows.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete workflow {namespace}/{name}"));
        }
        Ok(())
    }

    async fn complete_workflow_nodes(
        &self,
        namespace: &str,
        name: &str,
        node_ids: Vec<String>,
        _finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let workflow = state
            .workflows
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found(name))?;
        if let Some(status) = workflow.status.as_mut() {
            for id in &node_ids {
                if let Some(node) = status.nodes.get_mut(id) {
                    node.phase = "Succeeded".to_string();
                }
            }
            if status.nodes.values().all(|n| n.phase == "Succeeded") {
                status.phase = WorkflowPhase::Running;
            }
        }
        state.log.push(format!("resume workflow {namespace}/{name}"));
        Ok(())
    }

    async fn get_remediation_status(&self, namespace: &str, name: &str) -> Result<Option<RemediationWorkflowStatus>> {
        Ok(self
            .state()
            .remediation_status
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus> {
        let mut state = self.state();
        let mut stored = status.clone();
        bump_version(&mut stored.metadata);
        state
            .remediation_status
            .insert(key(namespace, &status.name_any()), stored.clone());
        Ok(stored)
    }

    async fn replace_remediation_status(
        &self,
        namespace: &str,
        status: &RemediationWorkflowStatus,
    ) -> Result<RemediationWorkflowStatus> {
        let mut state = self.state();
        let mut stored = status.clone();
        bump_version(&mut stored.metadata);
        state
            .remediation_status
            .insert(key(namespace, &status.name_any()), stored.clone());
        Ok(stored)
    }

    async fn patch_device_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        self.state()
            .device_config_status
            .insert(key(namespace, name), status);
        Ok(())
    }
}
