//! Build a remediation `Workflow` for one node from a template.

use super::mapping::ConditionWorkflowMapping;
use crate::clock::parse_duration;
use crate::config::OperatorConfig;
use crate::crds::argo::{Arguments, Parameter, TtlStrategy};
use crate::crds::deviceconfig::DrainSpec;
use crate::crds::{DeviceConfig, Workflow, WorkflowTemplate};
use crate::nodes::{HOSTNAME_LABEL, NO_SCHEDULE};
use k8s_openapi::api::core::v1::{Taint, Toleration};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Taint the default workflow applies while remediating
pub const REMEDIATION_TAINT_KEY: &str = "amd-gpu-unhealthy";

/// Label on every workflow the dispatcher creates
pub const REMEDIATION_NODE_LABEL: &str = "operator.amd.com/remediation-node";

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Taints marking `condition` as under remediation: the DeviceConfig's
/// custom taints, else `amd-gpu-unhealthy=<condition>:NoSchedule`.
pub fn remediation_taints(dc: &DeviceConfig, condition: &str) -> Vec<Taint> {
    let custom = &dc.spec.remediation_workflow.node_remediation_taints;
    if !custom.is_empty() {
        return custom.clone();
    }
    vec![Taint {
        key: REMEDIATION_TAINT_KEY.to_string(),
        value: Some(condition.to_string()),
        effect: NO_SCHEDULE.to_string(),
        time_added: None,
    }]
}

/// `key=value:effect` strings handed to the taint and untaint steps
pub fn node_taints(dc: &DeviceConfig, condition: &str) -> Vec<String> {
    remediation_taints(dc, condition)
        .iter()
        .map(|t| format!("{}={}:{}", t.key, t.value.as_deref().unwrap_or_default(), t.effect))
        .collect()
}

/// `key=value` strings handed to the label steps
pub fn node_labels(dc: &DeviceConfig) -> Vec<String> {
    dc.spec
        .remediation_workflow
        .node_remediation_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

fn default_drain_policy(namespace: &str) -> DrainSpec {
    DrainSpec {
        force: Some(true),
        timeout_seconds: 300,
        grace_period_seconds: -1,
        ignore_daemon_sets: Some(true),
        ignore_namespaces: vec![
            "kube-system".to_string(),
            "cert-manager".to_string(),
            namespace.to_string(),
        ],
    }
}

fn ttl_seconds(dc: &DeviceConfig, config: &OperatorConfig) -> i32 {
    let configured = &dc.spec.remediation_workflow.ttl_for_failed_workflows;
    let ttl = parse_duration(configured).unwrap_or_else(|| {
        if !configured.is_empty() {
            warn!(ttl = %configured, "Unparseable workflow TTL, using default");
        }
        parse_duration(&config.remediation.failed_workflow_ttl).unwrap_or(DEFAULT_TTL)
    });
    i32::try_from(ttl.as_secs()).unwrap_or(i32::MAX)
}

fn to_json<T: serde::Serialize>(value: &T, fallback: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| fallback.to_string())
}

/// Instantiate `template` for `node`: pin every step to the node, tolerate
/// the remediation taints and pass the mapping's parameters.
pub fn populate_workflow(
    template: &WorkflowTemplate,
    mapping: &ConditionWorkflowMapping,
    node: &str,
    dc: &DeviceConfig,
    config: &OperatorConfig,
    service_account: Option<String>,
) -> Workflow {
    let namespace = dc.namespace_or_default();
    let condition = &mapping.node_condition;
    let mut spec = template.spec.workflow.clone();

    spec.service_account_name = service_account;
    spec.ttl_strategy = Some(TtlStrategy {
        seconds_after_completion: Some(ttl_seconds(dc, config)),
    });

    let tolerations: Vec<Toleration> = remediation_taints(dc, condition)
        .into_iter()
        .map(|t| Toleration {
            key: Some(t.key),
            operator: Some("Exists".to_string()),
            effect: Some(t.effect),
            ..Default::default()
        })
        .collect();
    for t in &mut spec.templates {
        t.node_selector.insert(HOSTNAME_LABEL.to_string(), node.to_string());
        t.tolerations.extend(tolerations.iter().cloned());
    }

    let remediation = &dc.spec.remediation_workflow;
    let tester_image = if remediation.tester_image.is_empty() {
        config.images.test_runner_image.clone()
    } else {
        remediation.tester_image.clone()
    };
    let init_image = if dc.spec.common_config.init_container_image.is_empty() {
        config.images.init_container_image.clone()
    } else {
        dc.spec.common_config.init_container_image.clone()
    };
    let drain_policy = remediation
        .node_drain_policy
        .clone()
        .unwrap_or_else(|| default_drain_policy(&namespace));
    let tests = &mapping.validation_tests;

    spec.arguments = Some(Arguments {
        parameters: vec![
            Parameter::new("node_condition", condition.as_str()),
            Parameter::new("node_name", node),
            Parameter::new("framework", tests.framework.as_str()),
            Parameter::new("recipe", tests.recipe.as_str()),
            Parameter::new("iterations", tests.iterations.to_string()),
            Parameter::new("stopOnFailure", tests.stop_on_failure.to_string()),
            Parameter::new("timeoutSeconds", tests.timeout_seconds.to_string()),
            Parameter::new("testRunnerImage", tester_image),
            Parameter::new("testRunnerServiceAccount", config.images.test_runner_service_account.as_str()),
            Parameter::new("namespace", namespace.as_str()),
            Parameter::new("notifyMessage", mapping.notify_remediation_message.as_str()),
            Parameter::new(
                "notifyErrorMessage",
                format!(
                    "Remediation for node condition {condition} failed on node {node}. {}",
                    mapping.notify_test_failure_message
                ),
            ),
            Parameter::new(
                "notifySuccessMessage",
                format!("Remediation for node condition {condition} completed successfully on node {node}"),
            ),
            Parameter::new("initContainerImage", init_image),
            Parameter::new("node_labels", to_json(&node_labels(dc), "[]")),
            Parameter::new("node_taints", to_json(&node_taints(dc, condition), "[]")),
            Parameter::new("drain_policy", to_json(&drain_policy, "{}")),
            Parameter::new("skipRebootStep", mapping.skip_reboot_step.to_string()),
            Parameter::new("auto_start", remediation.auto_start_workflow.unwrap_or(true).to_string()),
        ],
    });

    Workflow {
        metadata: ObjectMeta {
            generate_name: Some(format!("{node}-{}-", mapping.workflow_template)),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(REMEDIATION_NODE_LABEL.to_string(), node.to_string())])),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::UpgradePolicySpec;
    use crate::remediation::template::default_template;
    use crate::upgrade::worker::fixtures::device_config;
    use kube::ResourceExt;

    fn mapping() -> ConditionWorkflowMapping {
        ConditionWorkflowMapping {
            node_condition: "AMDGPUUnhealthy".to_string(),
            workflow_template: "default-template".to_string(),
            notify_test_failure_message: "Check the cooling.".to_string(),
            skip_reboot_step: true,
            ..Default::default()
        }
    }

    fn param<'a>(wf: &'a Workflow, name: &str) -> &'a str {
        wf.spec
            .arguments
            .as_ref()
            .and_then(|a| a.parameters.iter().find(|p| p.name == name))
            .and_then(|p| p.value.as_deref())
            .unwrap_or_else(|| panic!("missing parameter {name}"))
    }

    fn populate(dc: &DeviceConfig) -> Workflow {
        let config = OperatorConfig::default();
        let template = default_template(dc, &config).unwrap();
        populate_workflow(&template, &mapping(), "n1", dc, &config, Some("gpu-controller-manager".to_string()))
    }

    #[test]
    fn every_step_is_pinned_and_tolerates_the_taint() {
        let dc = device_config("6.2", UpgradePolicySpec::default());
        let wf = populate(&dc);

        assert_eq!(wf.metadata.generate_name.as_deref(), Some("n1-default-template-"));
        assert_eq!(wf.labels().get(REMEDIATION_NODE_LABEL).map(String::as_str), Some("n1"));
        assert_eq!(wf.spec.service_account_name.as_deref(), Some("gpu-controller-manager"));
        assert!(!wf.spec.templates.is_empty());
        for t in &wf.spec.templates {
            assert_eq!(t.node_selector.get(HOSTNAME_LABEL).map(String::as_str), Some("n1"));
            assert_eq!(t.tolerations.len(), 1);
            assert_eq!(t.tolerations[0].key.as_deref(), Some(REMEDIATION_TAINT_KEY));
            assert_eq!(t.tolerations[0].operator.as_deref(), Some("Exists"));
        }
    }

    #[test]
    fn parameters_carry_mapping_and_defaults() {
        let dc = device_config("6.2", UpgradePolicySpec::default());
        let wf = populate(&dc);

        assert_eq!(param(&wf, "node_condition"), "AMDGPUUnhealthy");
        assert_eq!(param(&wf, "testRunnerImage"), "docker.io/rocm/test-runner:v1.4.1");
        assert_eq!(param(&wf, "initContainerImage"), "busybox:1.36");
        assert_eq!(param(&wf, "node_taints"), r#"["amd-gpu-unhealthy=AMDGPUUnhealthy:NoSchedule"]"#);
        assert_eq!(param(&wf, "node_labels"), "[]");
        assert_eq!(param(&wf, "skipRebootStep"), "true");
        assert_eq!(param(&wf, "auto_start"), "true");
        assert_eq!(
            param(&wf, "notifyErrorMessage"),
            "Remediation for node condition AMDGPUUnhealthy failed on node n1. Check the cooling."
        );

        let drain: serde_json::Value = serde_json::from_str(param(&wf, "drain_policy")).unwrap();
        assert_eq!(drain["force"], true);
        assert_eq!(drain["timeoutSeconds"], 300);
        assert_eq!(drain["ignoreNamespaces"], serde_json::json!(["kube-system", "cert-manager", "gpu"]));
        assert_eq!(wf.spec.ttl_strategy.as_ref().unwrap().seconds_after_completion, Some(86400));
    }

    #[test]
    fn custom_taints_and_labels_replace_the_defaults() {
        let mut dc = device_config("6.2", UpgradePolicySpec::default());
        let remediation = &mut dc.spec.remediation_workflow;
        remediation.node_remediation_taints = vec![Taint {
            key: "gpu-maintenance".to_string(),
            value: Some("true".to_string()),
            effect: "NoExecute".to_string(),
            time_added: None,
        }];
        remediation.node_remediation_labels = BTreeMap::from([("gpu-state".to_string(), "repair".to_string())]);
        remediation.ttl_for_failed_workflows = "2h".to_string();
        remediation.auto_start_workflow = Some(false);

        let wf = populate(&dc);

        assert_eq!(param(&wf, "node_taints"), r#"["gpu-maintenance=true:NoExecute"]"#);
        assert_eq!(param(&wf, "node_labels"), r#"["gpu-state=repair"]"#);
        assert_eq!(param(&wf, "auto_start"), "false");
        assert_eq!(wf.spec.templates[0].tolerations[0].effect.as_deref(), Some("NoExecute"));
        assert_eq!(wf.spec.ttl_strategy.as_ref().unwrap().seconds_after_completion, Some(7200));
    }

    #[test]
    fn bad_ttl_falls_back_to_a_day() {
        let mut dc = device_config("6.2", UpgradePolicySpec::default());
        dc.spec.remediation_workflow.ttl_for_failed_workflows = "forever".to_string();
        assert_eq!(ttl_seconds(&dc, &OperatorConfig::default()), 86400);
    }
}
