//! Built-in Argo workflow templates.
//!
//! `event-notify-template` raises a Kubernetes event on the node;
//! `default-template` is the canonical remediation sequence. Step scripts
//! are compiled into the binary.

use crate::config::OperatorConfig;
use crate::crds::{DeviceConfig, WorkflowTemplate, WorkflowTemplateSpec};
use crate::error::Result;
use crate::upgrade::reboot::utils_image;
use kube::api::ObjectMeta;
use serde_json::{json, Value};

pub const DEFAULT_TEMPLATE: &str = "default-template";
pub const NOTIFY_TEMPLATE: &str = "event-notify-template";

/// Event reasons raised by the notify steps
pub const REMEDIATION_REQUIRED_EVENT: &str = "amd-gpu-remediation-required";
pub const REMEDIATION_SUCCEEDED_EVENT: &str = "amd-gpu-remediation-succeeded";
pub const REMEDIATION_FAILED_EVENT: &str = "amd-gpu-remediation-failed";

const NOTIFY_SH: &str = include_str!("../../remediation/scripts/notify.sh");
const TAINT_SH: &str = include_str!("../../remediation/scripts/taint.sh");
const DRAIN_SH: &str = include_str!("../../remediation/scripts/drain.sh");
const TEST_SH: &str = include_str!("../../remediation/scripts/test.sh");
const WAIT_SH: &str = include_str!("../../remediation/scripts/wait.sh");
const UNTAINT_SH: &str = include_str!("../../remediation/scripts/untaint.sh");
const APPLY_LABELS_SH: &str = include_str!("../../remediation/scripts/applylabels.sh");
const REMOVE_LABELS_SH: &str = include_str!("../../remediation/scripts/removelabels.sh");

const REBOOT_POD_PATCH: &str = "hostPID: true
hostNetwork: true
containers:
- name: main
  stdin: true
  tty: true
";

const TEST_FAILED: &str = "{{steps.test.exitCode}} != 0";
const TEST_PASSED: &str = "{{steps.test.exitCode}} == 0";

fn utility_container(dc: &DeviceConfig, config: &OperatorConfig) -> Value {
    let mut container = json!({ "image": utils_image(dc, config) });
    let pull_policy = &dc.spec.common_config.utils_container.image_pull_policy;
    if !pull_policy.is_empty() {
        container["imagePullPolicy"] = json!(pull_policy);
    }
    container
}

fn script_container(dc: &DeviceConfig, config: &OperatorConfig, source: &str) -> Value {
    let mut script = utility_container(dc, config);
    script["command"] = json!(["sh"]);
    script["source"] = json!(source);
    script
}

/// Template input parameters that forward the workflow parameter of the same name
fn forwarded(names: &[&str]) -> Value {
    let parameters: Vec<Value> = names
        .iter()
        .map(|name| json!({ "name": name, "value": format!("{{{{workflow.parameters.{name}}}}}") }))
        .collect();
    json!({ "parameters": parameters })
}

fn step(name: &str, template: &str) -> Value {
    json!([{ "name": name, "template": template }])
}

fn step_when(name: &str, template: &str, when: &str) -> Value {
    json!([{ "name": name, "template": template, "when": when }])
}

fn notify_step(name: &str, message_param: &str, event: &str, when: Option<&str>) -> Value {
    let mut s = json!({
        "name": name,
        "templateRef": { "name": NOTIFY_TEMPLATE, "template": "notify" },
        "arguments": { "parameters": [
            { "name": "nodeName", "value": "{{workflow.parameters.node_name}}" },
            { "name": "notifyMessage", "value": format!("{{{{workflow.parameters.{message_param}}}}}") },
            { "name": "eventName", "value": event },
        ]},
    });
    if let Some(when) = when {
        s["when"] = json!(when);
    }
    json!([s])
}

fn build(namespace: &str, name: &str, spec: Value) -> Result<WorkflowTemplate> {
    let spec: WorkflowTemplateSpec = serde_json::from_value(spec)?;
    Ok(WorkflowTemplate {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec,
    })
}

pub fn notify_template(dc: &DeviceConfig, config: &OperatorConfig) -> Result<WorkflowTemplate> {
    let spec = json!({
        "entrypoint": "notify",
        "templates": [{
            "name": "notify",
            "inputs": { "parameters": [
                { "name": "nodeName" },
                { "name": "notifyMessage" },
                { "name": "eventName" },
            ]},
            "script": script_container(dc, config, NOTIFY_SH),
        }],
    });
    build(&dc.namespace_or_default(), NOTIFY_TEMPLATE, spec)
}

pub fn default_template(dc: &DeviceConfig, config: &OperatorConfig) -> Result<WorkflowTemplate> {
    let mut reboot = utility_container(dc, config);
    reboot["command"] = json!(["/nsenter", "--all", "--target=1", "--", "/sbin/reboot", "-f"]);
    reboot["securityContext"] = json!({ "privileged": true });

    let steps = json!([
        step_when("autostart", "suspend", "{{workflow.parameters.auto_start}} == 'false'"),
        step("applylabels", "applylabels"),
        step("taint", "taint"),
        step("drain", "drain"),
        notify_step("notifybeforesuspend", "notifyMessage", REMEDIATION_REQUIRED_EVENT, None),
        step("suspend", "suspend"),
        [{
            "name": "reboot",
            "template": "reboot",
            "continueOn": { "failed": true },
            "when": "{{workflow.parameters.skipRebootStep}} == 'false'",
        }],
        [{ "name": "test", "template": "test", "continueOn": { "failed": true } }],
        notify_step("notifygputestfailed", "notifyErrorMessage", REMEDIATION_FAILED_EVENT, Some(TEST_FAILED)),
        step_when("failurecleanup", "removelabels", TEST_FAILED),
        step_when("failworkflow", "failworkflow", TEST_FAILED),
        step_when("wait", "wait", TEST_PASSED),
        step_when("untaint", "untaint", TEST_PASSED),
        notify_step("notifyworkflowsucceeded", "notifySuccessMessage", REMEDIATION_SUCCEEDED_EVENT, Some(TEST_PASSED)),
        step_when("successcleanup", "removelabels", TEST_PASSED),
    ]);

    let mut apply_labels_inputs = forwarded(&["node_name"]);
    if let Some(params) = apply_labels_inputs["parameters"].as_array_mut() {
        params.push(json!({ "name": "labels", "value": "{{workflow.parameters.node_labels}}" }));
    }

    let spec = json!({
        "entrypoint": "inbuilt",
        "templates": [
            { "name": "inbuilt", "steps": steps },
            {
                "name": "taint",
                "inputs": forwarded(&["node_condition", "node_name"]),
                "script": script_container(dc, config, TAINT_SH),
            },
            { "name": "suspend", "suspend": {} },
            {
                "name": "drain",
                "inputs": forwarded(&["node_name"]),
                "script": script_container(dc, config, DRAIN_SH),
            },
            { "name": "reboot", "container": reboot, "podSpecPatch": REBOOT_POD_PATCH },
            {
                "name": "test",
                "inputs": forwarded(&[
                    "node_name",
                    "framework",
                    "recipe",
                    "iterations",
                    "stopOnFailure",
                    "timeoutSeconds",
                    "testRunnerImage",
                    "testRunnerServiceAccount",
                    "namespace",
                    "initContainerImage",
                ]),
                "script": script_container(dc, config, TEST_SH),
            },
            {
                "name": "wait",
                "inputs": forwarded(&["node_condition", "node_name"]),
                "script": script_container(dc, config, WAIT_SH),
            },
            {
                "name": "untaint",
                "inputs": forwarded(&["node_name"]),
                "script": script_container(dc, config, UNTAINT_SH),
            },
            {
                "name": "failworkflow",
                "script": script_container(dc, config, "echo \"Failing workflow\" && exit 1"),
            },
            {
                "name": "applylabels",
                "inputs": apply_labels_inputs,
                "script": script_container(dc, config, APPLY_LABELS_SH),
            },
            {
                "name": "removelabels",
                "inputs": forwarded(&["node_name"]),
                "script": script_container(dc, config, REMOVE_LABELS_SH),
            },
        ],
    });
    build(&dc.namespace_or_default(), DEFAULT_TEMPLATE, spec)
}
