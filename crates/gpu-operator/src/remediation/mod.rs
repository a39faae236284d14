//! Remediation Workflow Dispatcher.
//!
//! Maps unhealthy node conditions to Argo remediation workflows. Each pass
//! ensures the default objects exist, resolves the mapping for every node,
//! takes care of workflows already running for the node (resume, abort,
//! clean up) and creates at most one new workflow per node, subject to the
//! remediation taint, the driver upgrade state and the recovery policy.

pub mod mapping;
pub mod recovery;
pub mod template;
pub mod workflow;


use crate::clock::{format_timestamp, parse_duration, Clock};
use crate::cluster::{retry_on_conflict, update_node, ClusterClient};
use crate::config::OperatorConfig;
use crate::crds::remediation_status::{RemediationWorkflowStatusSpec, REMEDIATION_STATUS_NAME};
use crate::crds::{DeviceConfig, RemediationWorkflowStatus, UpgradePhase, Workflow, WorkflowAttempt, WorkflowPhase};
use crate::error::{Error, Result};
use crate::nodes;
use crate::upgrade::state::FleetStateStore;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use mapping::{ConditionWorkflowMapping, MappingTable, DEFAULT_MAPPINGS, MAPPING_DATA_KEY};
use recovery::{prune_attempts, RecoveryTracker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Node label that releases a suspended workflow regardless of the mapping
pub const FORCE_RESUME_LABEL: &str = "operator.amd.com/gpu-force-resume-workflow";

/// Node label that deletes the node's suspended workflow
pub const ABORT_WORKFLOW_LABEL: &str = "operator.amd.com/gpu-abort-workflow";

const LABEL_TRUE: &str = "true";

/// Suspend step gating workflows created with `auto_start=false`
const AUTOSTART_STEP: &str = "autostart";

pub struct RemediationDispatcher {
    client: Arc<dyn ClusterClient>,
    config: Arc<OperatorConfig>,
    clock: Arc<dyn Clock>,
    upgrade_states: Arc<FleetStateStore>,
    tracker: RecoveryTracker,
    /// Workflow service account per namespace, cached once found
    service_accounts: DashMap<String, String>,
    /// Last `parallelism` written per DeviceConfig
    parallelism: DashMap<String, u32>,
}

impl RemediationDispatcher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: Arc<OperatorConfig>,
        clock: Arc<dyn Clock>,
        upgrade_states: Arc<FleetStateStore>,
    ) -> Self {
        Self {
            client,
            config,
            clock,
            upgrade_states,
            tracker: RecoveryTracker::new(),
            service_accounts: DashMap::new(),
            parallelism: DashMap::new(),
        }
    }

    fn attempts(&self) -> u32 {
        self.config.conflict_retry_attempts
    }

    fn max_runs(&self, mapping: &ConditionWorkflowMapping) -> u32 {
        mapping.recovery_policy.max_runs(self.config.remediation.recovery_max_runs)
    }

    fn window(&self, mapping: &ConditionWorkflowMapping) -> Duration {
        let default = parse_duration(&self.config.remediation.recovery_window).unwrap_or(Duration::from_secs(15 * 60));
        mapping.recovery_policy.window(default)
    }

    /// Counts only attempts inside the mapping's window.
    fn recovery_violated(&self, node: &str, mapping: &ConditionWorkflowMapping) -> bool {
        let condition = &mapping.node_condition;
        self.tracker
            .drop_older_than(node, condition, self.window(mapping), self.clock.now());
        self.tracker.is_violated(node, condition, self.max_runs(mapping))
    }

    /// Run one dispatch pass. `None` means remediation is off.
    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn handle_remediation(&self, dc: &DeviceConfig, nodes: &[Node]) -> Result<Option<Duration>> {
        if !dc.remediation_enabled() {
            return Ok(None);
        }
        let namespace = dc.namespace_or_default();
        if !self.workflow_controller_present(&namespace).await? {
            info!("Workflow controller pod not found, skipping remediation");
            return Ok(None);
        }

        let mapping_cm = self.ensure_default_objects(dc).await?;

        if let Err(e) = self.update_parallelism(dc).await {
            error!(error = %e, "Failed to update workflow parallelism, continuing");
        }

        self.sync_recovery_attempts(&namespace).await?;

        let document = mapping_cm
            .data
            .as_ref()
            .and_then(|d| d.get(MAPPING_DATA_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        let table = MappingTable::parse(document)?;
        let workflows = self.client.list_workflows(&namespace).await?;

        let mut errors = Vec::new();
        for node in nodes {
            let name = node.name_any();
            let Some(mapping) = table.resolve(node) else {
                continue;
            };
            if !self.settle_existing_workflows(&namespace, node, mapping, &workflows).await {
                continue;
            }
            if !self.can_schedule(dc, node, mapping) {
                continue;
            }
            info!(
                node = %name,
                condition = %mapping.node_condition,
                template = %mapping.workflow_template,
                "Node unhealthy, starting remediation workflow"
            );
            if let Err(e) = self.start_workflow(dc, &name, mapping).await {
                error!(node = %name, error = %e, "Failed to start remediation workflow");
                errors.push(e);
            }
        }

        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(Some(self.config.requeue_delay())),
        }
    }

    async fn workflow_controller_present(&self, namespace: &str) -> Result<bool> {
        let prefix = &self.config.remediation.workflow_controller_pod_prefix;
        let pods = self.client.list_pods(namespace).await?;
        Ok(pods.iter().any(|p| p.name_any().starts_with(prefix.as_str())))
    }

    /// Mapping ConfigMap, default templates and the status resource.
    /// Returns the mapping ConfigMap.
    async fn ensure_default_objects(&self, dc: &DeviceConfig) -> Result<ConfigMap> {
        let namespace = dc.namespace_or_default();
        let (cm_name, user_supplied) = dc.mapping_config_map();

        let mapping_cm = match self.client.get_config_map(&namespace, &cm_name).await? {
            Some(cm) => cm,
            None if user_supplied => {
                return Err(Error::MappingError(format!(
                    "ConfigMap {namespace}/{cm_name} referenced by the DeviceConfig does not exist"
                )));
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(cm_name.clone()),
                        namespace: Some(namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(MAPPING_DATA_KEY.to_string(), DEFAULT_MAPPINGS.to_string())])),
                    ..Default::default()
                };
                let created = self.client.create_config_map(&namespace, &cm).await?;
                info!(config_map = %cm_name, "Created default condition mapping");
                created
            }
        };

        if self
            .client
            .get_workflow_template(&namespace, template::NOTIFY_TEMPLATE)
            .await?
            .is_none()
        {
            let t = template::notify_template(dc, &self.config)?;
            self.client.create_workflow_template(&namespace, &t).await?;
            info!(template = template::NOTIFY_TEMPLATE, "Created workflow template");
        }
        if self
            .client
            .get_workflow_template(&namespace, template::DEFAULT_TEMPLATE)
            .await?
            .is_none()
        {
            let t = template::default_template(dc, &self.config)?;
            self.client.create_workflow_template(&namespace, &t).await?;
            info!(template = template::DEFAULT_TEMPLATE, "Created workflow template");
        }

        if self
            .client
            .get_remediation_status(&namespace, REMEDIATION_STATUS_NAME)
            .await?
            .is_none()
        {
            let mut status = RemediationWorkflowStatus::new(REMEDIATION_STATUS_NAME, RemediationWorkflowStatusSpec {});
            status.metadata.namespace = Some(namespace.clone());
            status.status = Some(BTreeMap::new());
            self.client.create_remediation_status(&namespace, &status).await?;
            info!("Created remediation workflow status");
        }

        Ok(mapping_cm)
    }

    /// Push `maxParallelWorkflows` into the workflow controller ConfigMap
    /// when it changed since the last successful write.
    async fn update_parallelism(&self, dc: &DeviceConfig) -> Result<()> {
        let desired = dc.spec.remediation_workflow.max_parallel_workflows;
        let scope = dc.scope_key();
        if self.parallelism.get(&scope).map_or(0, |v| *v) == desired {
            return Ok(());
        }
        let namespace = dc.namespace_or_default();
        let cm_name = &self.config.remediation.workflow_controller_config_map;

        retry_on_conflict(self.attempts(), || {
            let namespace = namespace.as_str();
            async move {
                let mut cm = self
                    .client
                    .get_config_map(namespace, cm_name)
                    .await?
                    .ok_or_else(|| Error::MappingError(format!("ConfigMap {namespace}/{cm_name} not found")))?;
                cm.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert("parallelism".to_string(), desired.to_string());
                self.client.replace_config_map(namespace, &cm).await
            }
        })
        .await?;

        self.parallelism.insert(scope, desired);
        info!(parallelism = desired, "Updated maximum parallel remediation workflows");
        Ok(())
    }

    /// Prune the status resource to the retention window and rebuild the
    /// in-memory tracker from it.
    async fn sync_recovery_attempts(&self, namespace: &str) -> Result<()> {
        let retention = parse_duration(&self.config.remediation.status_retention).unwrap_or(Duration::from_secs(72 * 3600));
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| self.clock.now().checked_sub_signed(r))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let status = retry_on_conflict(self.attempts(), || async move {
            let mut status = self
                .client
                .get_remediation_status(namespace, REMEDIATION_STATUS_NAME)
                .await?
                .ok_or(Error::MissingObjectKey("RemediationWorkflowStatus/default"))?;
            let recorded = status.status.get_or_insert_with(BTreeMap::new);
            if prune_attempts(recorded, cutoff) {
                debug!("Pruned expired remediation attempts");
                return self.client.replace_remediation_status(namespace, &status).await;
            }
            Ok(status)
        })
        .await?;

        self.tracker.sync_from(&status.status.unwrap_or_default());
        Ok(())
    }

    /// Deal with workflows already created for `node`. Returns whether a
    /// new workflow may be created this pass.
    async fn settle_existing_workflows(
        &self,
        namespace: &str,
        node: &Node,
        mapping: &ConditionWorkflowMapping,
        workflows: &[Workflow],
    ) -> bool {
        let name = node.name_any();
        let prefix = format!("{name}-");
        for wf in workflows.iter().filter(|wf| wf.name_any().starts_with(&prefix)) {
            let wf_name = wf.name_any();
            match wf.phase() {
                WorkflowPhase::Succeeded => {
                    if let Err(e) = self.client.delete_workflow(namespace, &wf_name).await {
                        error!(node = %name, workflow = %wf_name, error = %e, "Failed to delete completed workflow");
                        return false;
                    }
                    info!(node = %name, workflow = %wf_name, "Deleted completed workflow");
                }
                WorkflowPhase::Running => {
                    return self.handle_running_workflow(namespace, node, mapping, wf).await;
                }
                WorkflowPhase::Pending => {
                    debug!(node = %name, workflow = %wf_name, "Workflow pending, not creating another");
                    return false;
                }
                WorkflowPhase::Failed | WorkflowPhase::Error => {}
            }
        }
        true
    }

    /// A running workflow blocks creation unless it is suspended and the
    /// node asks for an abort. Suspended workflows are resumed when allowed.
    async fn handle_running_workflow(
        &self,
        namespace: &str,
        node: &Node,
        mapping: &ConditionWorkflowMapping,
        wf: &Workflow,
    ) -> bool {
        let name = node.name_any();
        let wf_name = wf.name_any();
        let suspended = wf.suspended_steps();
        let Some((_, stage)) = suspended.first() else {
            debug!(node = %name, workflow = %wf_name, "Workflow running");
            return false;
        };
        info!(node = %name, workflow = %wf_name, stage = %stage, "Suspended workflow found");

        if nodes::label(node, ABORT_WORKFLOW_LABEL) == Some(LABEL_TRUE) {
            info!(node = %name, workflow = %wf_name, "Abort label found, deleting workflow");
            if let Err(e) = self.client.delete_workflow(namespace, &wf_name).await {
                error!(node = %name, workflow = %wf_name, error = %e, "Failed to abort workflow");
                return false;
            }
            if let Err(e) = self.remove_node_label(&name, ABORT_WORKFLOW_LABEL).await {
                error!(node = %name, error = %e, "Failed to remove abort label");
                return false;
            }
            return true;
        }

        if self.can_resume(node, mapping, stage) {
            let ids = suspended.iter().map(|(id, _)| id.clone()).collect();
            if let Err(e) = self
                .client
                .complete_workflow_nodes(namespace, &wf_name, ids, self.clock.now())
                .await
            {
                error!(node = %name, workflow = %wf_name, error = %e, "Failed to resume workflow");
                return false;
            }
            info!(node = %name, workflow = %wf_name, "Resumed suspended workflow");
            if nodes::label(node, FORCE_RESUME_LABEL) == Some(LABEL_TRUE) {
                if let Err(e) = self.remove_node_label(&name, FORCE_RESUME_LABEL).await {
                    error!(node = %name, error = %e, "Failed to remove force-resume label");
                }
            }
        }
        false
    }

    fn can_resume(&self, node: &Node, mapping: &ConditionWorkflowMapping, stage: &str) -> bool {
        let name = node.name_any();
        if self.recovery_violated(&name, mapping) {
            info!(node = %name, condition = %mapping.node_condition, "Recovery policy exhausted, not resuming");
            return false;
        }
        if !mapping.physical_action_needed && stage != AUTOSTART_STEP {
            return true;
        }
        let forced = nodes::label(node, FORCE_RESUME_LABEL) == Some(LABEL_TRUE);
        if !forced {
            info!(node = %name, "Waiting for force-resume label");
        }
        forced
    }

    async fn remove_node_label(&self, node: &str, key: &str) -> Result<()> {
        update_node(self.client.as_ref(), node, self.attempts(), |n| nodes::remove_label(n, key)).await?;
        Ok(())
    }

    /// Creation gates: remediation taint absent, no driver upgrade in a
    /// blocking phase, recovery policy not exhausted.
    fn can_schedule(&self, dc: &DeviceConfig, node: &Node, mapping: &ConditionWorkflowMapping) -> bool {
        let name = node.name_any();
        if has_remediation_taint(dc, node, &mapping.node_condition) {
            debug!(node = %name, "Remediation taint present, skipping");
            return false;
        }
        let phase = if self.upgrade_states.knows(&name) {
            self.upgrade_states.phase(&name)
        } else {
            dc.persisted_node_status(&name).map(|s| s.status).unwrap_or(UpgradePhase::Empty)
        };
        if phase.blocks_remediation() {
            info!(node = %name, %phase, "Driver install or upgrade in progress, skipping");
            return false;
        }
        if self.recovery_violated(&name, mapping) {
            info!(node = %name, condition = %mapping.node_condition, "Max remediation attempts reached, skipping");
            return false;
        }
        true
    }

    async fn service_account(&self, namespace: &str) -> Option<String> {
        if let Some(cached) = self.service_accounts.get(namespace) {
            return Some(cached.clone());
        }
        match self.client.list_service_accounts(namespace).await {
            Ok(accounts) => {
                let found = accounts
                    .iter()
                    .map(ResourceExt::name_any)
                    .find(|n| n.ends_with("controller-manager"))?;
                self.service_accounts.insert(namespace.to_string(), found.clone());
                Some(found)
            }
            Err(e) => {
                warn!(error = %e, "Failed to list service accounts");
                None
            }
        }
    }

    async fn start_workflow(&self, dc: &DeviceConfig, node: &str, mapping: &ConditionWorkflowMapping) -> Result<()> {
        let namespace = dc.namespace_or_default();
        let template = self
            .client
            .get_workflow_template(&namespace, &mapping.workflow_template)
            .await?
            .ok_or_else(|| {
                Error::MappingError(format!(
                    "WorkflowTemplate {namespace}/{} not found",
                    mapping.workflow_template
                ))
            })?;

        let service_account = self.service_account(&namespace).await;
        let wf = workflow::populate_workflow(&template, mapping, node, dc, &self.config, service_account);
        let created = self.client.create_workflow(&namespace, &wf).await?;
        let wf_name = created.name_any();
        info!(node = %node, workflow = %wf_name, "Remediation workflow created");

        let now = self.clock.now();
        let condition = &mapping.node_condition;
        self.tracker.drop_older_than(node, condition, self.window(mapping), now);
        self.tracker.register(node, condition, now);
        self.record_attempt(&namespace, node, condition, &wf_name, now).await
    }

    async fn record_attempt(
        &self,
        namespace: &str,
        node: &str,
        condition: &str,
        wf_name: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let attempt = WorkflowAttempt {
            name: wf_name.to_string(),
            start_time: format_timestamp(at),
        };
        retry_on_conflict(self.attempts(), || {
            let attempt = attempt.clone();
            async move {
                let mut status = self
                    .client
                    .get_remediation_status(namespace, REMEDIATION_STATUS_NAME)
                    .await?
                    .ok_or(Error::MissingObjectKey("RemediationWorkflowStatus/default"))?;
                status
                    .status
                    .get_or_insert_with(BTreeMap::new)
                    .entry(node.to_string())
                    .or_default()
                    .entry(condition.to_string())
                    .or_default()
                    .push(attempt);
                self.client.replace_remediation_status(namespace, &status).await
            }
        })
        .await?;
        Ok(())
    }

    /// DeviceConfig is going away: delete every workflow in the namespace
    /// and the operator-created mapping ConfigMap.
    #[instrument(skip_all, fields(device_config = %dc.scope_key()))]
    pub async fn handle_delete(&self, dc: &DeviceConfig) -> Result<()> {
        let namespace = dc.namespace_or_default();
        let workflows = self.client.list_workflows(&namespace).await?;
        for wf in &workflows {
            let wf_name = wf.name_any();
            match self.client.delete_workflow(&namespace, &wf_name).await {
                Ok(()) => info!(workflow = %wf_name, "Deleted workflow"),
                Err(e) => error!(workflow = %wf_name, error = %e, "Failed to delete workflow"),
            }
        }

        let (cm_name, user_supplied) = dc.mapping_config_map();
        if !user_supplied {
            match self.client.delete_config_map(&namespace, &cm_name).await {
                Ok(()) => info!(config_map = %cm_name, "Deleted mapping ConfigMap"),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!(config_map = %cm_name, error = %e, "Failed to delete mapping ConfigMap"),
            }
        }
        self.parallelism.remove(&dc.scope_key());
        Ok(())
    }
}

/// Whether `node` already carries one of the remediation taints for
/// `condition`. A taint without a value matches on key and effect alone.
pub fn has_remediation_taint(dc: &DeviceConfig, node: &Node, condition: &str) -> bool {
    let wanted = workflow::remediation_taints(dc, condition);
    nodes::taints(node).iter().any(|t| {
        wanted.iter().any(|w| {
            w.key == t.key
                && w.effect == t.effect
                && w.value.as_deref().map_or(true, |v| v.is_empty() || t.value.as_deref() == Some(v))
        })
    })
}
