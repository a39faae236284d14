//! Operator Configuration
//!
//! Images, service accounts, delays and poll schedules used by the upgrade
//! orchestrator and the remediation dispatcher. Loaded from a mounted YAML
//! file; every field has a default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "GPU_OPERATOR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";
pub const HEALTH_PORT_ENV: &str = "HEALTH_PORT";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Process settings taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSettings {
    pub config_path: String,
    /// `None` means the kube client's default namespace
    pub namespace: Option<String>,
    pub health_port: u16,
}

impl ProcessSettings {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let health_port = match var(HEALTH_PORT_ENV) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = %raw, "Invalid {HEALTH_PORT_ENV}, using {DEFAULT_HEALTH_PORT}");
                DEFAULT_HEALTH_PORT
            }),
            None => DEFAULT_HEALTH_PORT,
        };
        Self {
            config_path: var(CONFIG_PATH_ENV).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
            namespace: var(WATCH_NAMESPACE_ENV),
            health_port,
        }
    }
}

/// Main operator configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Delay before a reconcile pass is re-run while work is pending
    #[serde(default = "default_requeue_delay_seconds")]
    pub requeue_delay_seconds: u64,

    /// Elapsed time after which an in-flight or failed upgrade is marked `Failed`
    #[serde(default = "default_upgrade_timeout_seconds")]
    pub upgrade_timeout_seconds: u64,

    /// Attempts for read-modify-write updates that hit a conflict
    #[serde(default = "default_conflict_retry_attempts")]
    pub conflict_retry_attempts: u32,

    /// Upper bound on concurrently running node workers
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,

    /// Wait for the new driver to be reported loaded before rebooting
    #[serde(default = "default_driver_ready_poll")]
    pub driver_ready_poll: PollConfig,

    /// Wait for the node to go down after the reboot pod starts
    #[serde(default = "default_reboot_start_poll")]
    pub reboot_start_poll: PollConfig,

    /// Wait for the node to come back Ready after a reboot
    #[serde(default = "default_reboot_recovery_poll")]
    pub reboot_recovery_poll: PollConfig,

    /// Interval between drain progress checks
    #[serde(default = "default_drain_poll_interval_seconds")]
    pub drain_poll_interval_seconds: u64,

    /// Cluster runs OpenShift (selects the UBI utils image tag)
    #[serde(default)]
    pub openshift: bool,

    #[serde(default)]
    pub images: ImageDefaults,

    #[serde(default)]
    pub remediation: RemediationDefaults,
}

/// Bounded poll: check every `intervalSeconds` for at most `timeoutSeconds`
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Default images and service accounts
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageDefaults {
    /// Utility image repository, tagged with `utilsTag` or `utilsOpenshiftTag`
    #[serde(default = "default_utils_repository")]
    pub utils_repository: String,

    #[serde(default = "default_utils_tag")]
    pub utils_tag: String,

    #[serde(default = "default_utils_openshift_tag")]
    pub utils_openshift_tag: String,

    /// Service account the reboot pod runs as
    #[serde(default = "default_utils_service_account")]
    pub utils_service_account: String,

    #[serde(default = "default_test_runner_image")]
    pub test_runner_image: String,

    #[serde(default = "default_test_runner_service_account")]
    pub test_runner_service_account: String,

    #[serde(default = "default_init_container_image")]
    pub init_container_image: String,
}

/// Remediation workflow defaults
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationDefaults {
    /// Name prefix of the workflow controller pod; remediation is off without it
    #[serde(default = "default_workflow_controller_pod_prefix")]
    pub workflow_controller_pod_prefix: String,

    /// Workflow controller ConfigMap holding the `parallelism` key
    #[serde(default = "default_workflow_controller_config_map")]
    pub workflow_controller_config_map: String,

    /// TTL applied when the DeviceConfig does not set a parseable one
    #[serde(default = "default_failed_workflow_ttl")]
    pub failed_workflow_ttl: String,

    #[serde(default = "default_recovery_window")]
    pub recovery_window: String,

    #[serde(default = "default_recovery_max_runs")]
    pub recovery_max_runs: u32,

    /// Attempts older than this are pruned from the status resource
    #[serde(default = "default_status_retention")]
    pub status_retention: String,
}

fn default_requeue_delay_seconds() -> u64 {
    20
}

fn default_upgrade_timeout_seconds() -> u64 {
    7200 // 2 hours
}

fn default_conflict_retry_attempts() -> u32 {
    5
}

fn default_max_concurrent_workers() -> usize {
    64
}

fn default_driver_ready_poll() -> PollConfig {
    PollConfig {
        interval_seconds: 10,
        timeout_seconds: 3600,
    }
}

fn default_reboot_start_poll() -> PollConfig {
    PollConfig {
        interval_seconds: 2,
        timeout_seconds: 600,
    }
}

fn default_reboot_recovery_poll() -> PollConfig {
    PollConfig {
        interval_seconds: 10,
        timeout_seconds: 3600,
    }
}

fn default_drain_poll_interval_seconds() -> u64 {
    5
}

fn default_utils_repository() -> String {
    "docker.io/rocm/gpu-operator-utils".to_string()
}

fn default_utils_tag() -> String {
    "latest".to_string()
}

fn default_utils_openshift_tag() -> String {
    "rhubi-latest".to_string()
}

fn default_utils_service_account() -> String {
    "amd-gpu-operator-utils-container".to_string()
}

fn default_test_runner_image() -> String {
    "docker.io/rocm/test-runner:v1.4.1".to_string()
}

fn default_test_runner_service_account() -> String {
    "amd-gpu-operator-test-runner".to_string()
}

fn default_init_container_image() -> String {
    "busybox:1.36".to_string()
}

fn default_workflow_controller_pod_prefix() -> String {
    "amd-gpu-operator-workflow-controller".to_string()
}

fn default_workflow_controller_config_map() -> String {
    "workflow-controller-configmap".to_string()
}

fn default_failed_workflow_ttl() -> String {
    "24h".to_string()
}

fn default_recovery_window() -> String {
    "15m".to_string()
}

fn default_recovery_max_runs() -> u32 {
    3
}

fn default_status_retention() -> String {
    "72h".to_string()
}

impl Default for ImageDefaults {
    fn default() -> Self {
        ImageDefaults {
            utils_repository: default_utils_repository(),
            utils_tag: default_utils_tag(),
            utils_openshift_tag: default_utils_openshift_tag(),
            utils_service_account: default_utils_service_account(),
            test_runner_image: default_test_runner_image(),
            test_runner_service_account: default_test_runner_service_account(),
            init_container_image: default_init_container_image(),
        }
    }
}

impl Default for RemediationDefaults {
    fn default() -> Self {
        RemediationDefaults {
            workflow_controller_pod_prefix: default_workflow_controller_pod_prefix(),
            workflow_controller_config_map: default_workflow_controller_config_map(),
            failed_workflow_ttl: default_failed_workflow_ttl(),
            recovery_window: default_recovery_window(),
            recovery_max_runs: default_recovery_max_runs(),
            status_retention: default_status_retention(),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_delay_seconds: default_requeue_delay_seconds(),
            upgrade_timeout_seconds: default_upgrade_timeout_seconds(),
            conflict_retry_attempts: default_conflict_retry_attempts(),
            max_concurrent_workers: default_max_concurrent_workers(),
            driver_ready_poll: default_driver_ready_poll(),
            reboot_start_poll: default_reboot_start_poll(),
            reboot_recovery_poll: default_reboot_recovery_poll(),
            drain_poll_interval_seconds: default_drain_poll_interval_seconds(),
            openshift: false,
            images: ImageDefaults::default(),
            remediation: RemediationDefaults::default(),
        }
    }
}

impl OperatorConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_seconds)
    }

    pub fn upgrade_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.upgrade_timeout_seconds).unwrap_or(i64::MAX))
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.drain_poll_interval_seconds)
    }

    /// Utility image used for reboot pods and workflow steps when the
    /// DeviceConfig does not override it.
    pub fn default_utils_image(&self) -> String {
        let tag = if self.openshift {
            &self.images.utils_openshift_tag
        } else {
            &self.images.utils_tag
        };
        format!("{}:{}", self.images.utils_repository, tag)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.requeue_delay_seconds == 0 {
            return Err(anyhow::anyhow!("requeueDelaySeconds must be greater than zero"));
        }
        if self.conflict_retry_attempts == 0 {
            return Err(anyhow::anyhow!("conflictRetryAttempts must be at least 1"));
        }
        if self.max_concurrent_workers == 0 {
            return Err(anyhow::anyhow!("maxConcurrentWorkers must be at least 1"));
        }
        for (name, poll) in [
            ("driverReadyPoll", &self.driver_ready_poll),
            ("rebootStartPoll", &self.reboot_start_poll),
            ("rebootRecoveryPoll", &self.reboot_recovery_poll),
        ] {
            if poll.interval_seconds == 0 {
                return Err(anyhow::anyhow!("{name}.intervalSeconds must be greater than zero"));
            }
        }
        for (name, value) in [
            ("remediation.failedWorkflowTtl", &self.remediation.failed_workflow_ttl),
            ("remediation.recoveryWindow", &self.remediation.recovery_window),
            ("remediation.statusRetention", &self.remediation.status_retention),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| anyhow::anyhow!("{name} '{value}' is not a valid duration: {e}"))?;
        }
        if self.images.utils_repository.trim().is_empty() {
            return Err(anyhow::anyhow!("images.utilsRepository must not be empty"));
        }
        Ok(())
    }

    /// Load from `config_path`, falling back to defaults when the file is
    /// missing, unparseable or fails validation.
    pub fn load_or_default(config_path: &str) -> Self {
        let loaded = Self::from_mounted_file(config_path).and_then(|config| {
            config.validate()?;
            Ok(config)
        });
        match loaded {
            Ok(config) => {
                info!(path = %config_path, "Loaded operator configuration");
                config
            }
            Err(err) => {
                warn!(path = %config_path, error = %err, "Using default operator configuration");
                Self::default()
            }
        }
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: OperatorConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
