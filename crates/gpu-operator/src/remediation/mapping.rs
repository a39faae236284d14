//! Condition to workflow mapping document.
//!
//! The mapping ConfigMap holds a YAML list under the `workflow` key. Each
//! entry names a node condition, the workflow template that remediates it,
//! and the validation tests and recovery policy to apply.

use crate::clock::parse_duration;
use crate::error::Result;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// ConfigMap data key holding the mapping list
pub const MAPPING_DATA_KEY: &str = "workflow";

/// Mapping written into the operator-created ConfigMap
pub const DEFAULT_MAPPINGS: &str = include_str!("../../remediation/default-mappings.yaml");

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionWorkflowMapping {
    #[serde(default)]
    pub node_condition: String,
    #[serde(default)]
    pub workflow_template: String,

    #[serde(default, rename = "validationTestsProfile")]
    pub validation_tests: ValidationTestsProfile,

    /// Suspended workflows wait for the force-resume label
    #[serde(default)]
    pub physical_action_needed: bool,

    #[serde(default)]
    pub notify_remediation_message: String,

    #[serde(default)]
    pub notify_test_failure_message: String,

    #[serde(default)]
    pub recovery_policy: RecoveryPolicyConfig,

    #[serde(default)]
    pub skip_reboot_step: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTestsProfile {
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub recipe: String,
    #[serde(default)]
    pub iterations: i64,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub timeout_seconds: i64,
}

/// Caps workflow runs for one node condition within a sliding window.
/// Zero and empty values fall back to the operator defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPolicyConfig {
    #[serde(default)]
    pub max_allowed_runs_per_window: u32,
    #[serde(default)]
    pub window_size: String,
}

impl RecoveryPolicyConfig {
    pub fn max_runs(&self, default: u32) -> u32 {
        if self.max_allowed_runs_per_window == 0 {
            default
        } else {
            self.max_allowed_runs_per_window
        }
    }

    /// Window length; `default` is used when unset or unparseable.
    pub fn window(&self, default: Duration) -> Duration {
        if self.window_size.is_empty() {
            return default;
        }
        parse_duration(&self.window_size).unwrap_or(default)
    }
}

/// Parsed mapping document, keyed by condition name
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    by_condition: HashMap<String, ConditionWorkflowMapping>,
}

impl MappingTable {
    /// Parse the YAML list. A later entry for the same condition replaces
    /// an earlier one. Entries missing a condition or template are skipped;
    /// only a document that is not a mapping list at all is an error.
    pub fn parse(document: &str) -> Result<Self> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries: Vec<ConditionWorkflowMapping> = serde_yaml::from_str(document)?;

        let mut by_condition = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.node_condition.is_empty() || entry.workflow_template.is_empty() {
                warn!(
                    condition = %entry.node_condition,
                    template = %entry.workflow_template,
                    "Mapping entry needs nodeCondition and workflowTemplate, skipping"
                );
                continue;
            }
            let window = &entry.recovery_policy.window_size;
            if !window.is_empty() && parse_duration(window).is_none() {
                warn!(
                    condition = %entry.node_condition,
                    window = %window,
                    "Invalid recoveryPolicy.windowSize, using the default window"
                );
            }
            by_condition.insert(entry.node_condition.clone(), entry);
        }
        Ok(Self { by_condition })
    }

    pub fn len(&self) -> usize {
        self.by_condition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_condition.is_empty()
    }

    pub fn get(&self, condition: &str) -> Option<&ConditionWorkflowMapping> {
        self.by_condition.get(condition)
    }

    /// Mapping for the first `True` condition on `node` that has one, in
    /// the order the node reports its conditions.
    pub fn resolve(&self, node: &Node) -> Option<&ConditionWorkflowMapping> {
        let conditions = node.status.as_ref()?.conditions.as_ref()?;
        let found = conditions
            .iter()
            .filter(|c| c.status == "True")
            .find_map(|c| self.by_condition.get(&c.type_));
        if let Some(mapping) = found {
            debug!(node = %node.name_any(), condition = %mapping.node_condition, "Matching condition found");
        }
        found
    }
}
