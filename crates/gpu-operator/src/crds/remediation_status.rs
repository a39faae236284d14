//! `RemediationWorkflowStatus` Custom Resource Definition
//!
//! Durable record of remediation workflow attempts, keyed by node and node
//! condition. The recovery policy is evaluated against it so attempt counts
//! survive operator restarts.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the single status object per namespace
pub const REMEDIATION_STATUS_NAME: &str = "default";

/// node name -> node condition -> attempts, oldest first
pub type RemediationAttempts = BTreeMap<String, BTreeMap<String, Vec<WorkflowAttempt>>>;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "amd.com", version = "v1alpha1", kind = "RemediationWorkflowStatus")]
#[kube(namespaced)]
#[kube(status = "RemediationAttempts")]
pub struct RemediationWorkflowStatusSpec {}

/// One workflow started for a node condition
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct WorkflowAttempt {
    pub name: String,

    /// `YYYY-MM-DD HH:MM:SS UTC`
    #[serde(rename = "startTime")]
    pub start_time: String,
}
