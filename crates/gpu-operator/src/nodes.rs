//! Read-only helpers over `Node` objects.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;

/// Taint applied while a node's driver is being upgraded
pub const UPGRADE_TAINT_KEY: &str = "amd-gpu-driver-upgrade";
pub const UPGRADE_TAINT_VALUE: &str = "true";
pub const NO_SCHEDULE: &str = "NoSchedule";

/// Label an administrator sets on a failed node to request another attempt
pub const UPGRADE_STATE_LABEL: &str = "operator.amd.com/gpu-driver-upgrade-state";
pub const UPGRADE_REQUIRED: &str = "upgrade-required";

pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub fn upgrade_taint() -> Taint {
    Taint {
        key: UPGRADE_TAINT_KEY.to_string(),
        value: Some(UPGRADE_TAINT_VALUE.to_string()),
        effect: NO_SCHEDULE.to_string(),
        time_added: None,
    }
}

/// `Ready` condition is `True`
pub fn is_ready(node: &Node) -> bool {
    condition_status(node, "Ready") == Some("True")
}

/// Ready and not marked unschedulable
pub fn is_ready_for_upgrade(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false);
    !unschedulable && is_ready(node)
}

pub fn condition_status<'a>(node: &'a Node, condition_type: &str) -> Option<&'a str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition_type)
        .map(|c| c.status.as_str())
}

/// Condition types currently `True`, in the order the node reports them
pub fn true_conditions(node: &Node) -> impl Iterator<Item = &str> {
    node.status
        .iter()
        .filter_map(|status| status.conditions.as_ref())
        .flatten()
        .filter(|c| c.status == "True")
        .map(|c| c.type_.as_str())
}

pub fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default()
}

pub fn has_upgrade_taint(node: &Node) -> bool {
    taints(node)
        .iter()
        .any(|t| t.key == UPGRADE_TAINT_KEY && t.effect == NO_SCHEDULE)
}

pub fn label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.labels().get(key).map(String::as_str)
}

pub fn boot_id(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .node_info
        .as_ref()
        .map(|info| info.boot_id.as_str())
}

pub fn os_image(node: &Node) -> &str {
    node.status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map_or("", |info| info.os_image.as_str())
}

/// Driver version installed when the DeviceConfig leaves `version` empty
pub fn default_driver_version(node: &Node) -> Option<&'static str> {
    let os = os_image(node).to_lowercase();
    if os.contains("ubuntu") {
        ["20.04", "22.04", "24.04"]
            .iter()
            .any(|release| os.contains(release))
            .then_some("6.1.3")
    } else if os.contains("rhel") || os.contains("redhat") || os.contains("red hat") {
        Some("6.2.2")
    } else {
        None
    }
}

/// Add the upgrade taint; returns `false` when already present.
pub fn add_upgrade_taint(node: &mut Node) -> bool {
    if has_upgrade_taint(node) {
        return false;
    }
    let spec = node.spec.get_or_insert_with(Default::default);
    spec.taints.get_or_insert_with(Vec::new).push(upgrade_taint());
    true
}

/// Remove the upgrade taint; returns `false` when it was absent.
pub fn remove_upgrade_taint(node: &mut Node) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|spec| spec.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|t| !(t.key == UPGRADE_TAINT_KEY && t.effect == NO_SCHEDULE));
    taints.len() != before
}

/// Set a label; returns `false` when it already had that value.
pub fn set_label(node: &mut Node, key: &str, value: &str) -> bool {
    let labels = node.labels_mut();
    if labels.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    labels.insert(key.to_string(), value.to_string());
    true
}

/// Remove a label; returns `false` when it was absent.
pub fn remove_label(node: &mut Node, key: &str) -> bool {
    node.labels_mut().remove(key).is_some()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo};
    use kube::api::ObjectMeta;

    /// A Ready, schedulable Ubuntu node
    pub fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                conditions: Some(vec![condition("Ready", "True")]),
                node_info: Some(NodeSystemInfo {
                    boot_id: format!("{name}-boot-1"),
                    os_image: "Ubuntu 22.04.4 LTS".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    pub fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }
}
