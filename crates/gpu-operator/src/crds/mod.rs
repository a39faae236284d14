pub mod argo;
pub mod deviceconfig;
pub mod kmm;
pub mod remediation_status;

pub use argo::{Workflow, WorkflowPhase, WorkflowSpec, WorkflowTemplate, WorkflowTemplateSpec};
pub use deviceconfig::{
    DeviceConfig, DeviceConfigSpec, DeviceConfigStatus, ModuleStatus, UpgradePhase,
    UpgradePolicySpec,
};
pub use kmm::NodeModulesConfig;
pub use remediation_status::{RemediationAttempts, RemediationWorkflowStatus, WorkflowAttempt};
