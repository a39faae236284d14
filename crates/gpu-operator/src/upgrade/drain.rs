//! Pod drain before a driver swap.
//!
//! Only pods that hold the GPU are moved: those requesting an `amd.com`
//! GPU or partition resource, those mounting `/dev/dri`, and the operator's
//! own node agents. Everything else keeps running on the cordoned node.

use crate::cluster::ClusterClient;
use crate::crds::UpgradePolicySpec;
use crate::error::{Error, Result};
use crate::wait::{poll_until, PollSchedule, WaitOutcome};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GPU_RESOURCE: &str = "amd.com/gpu";
const PARTITION_COMPUTE_MODES: [&str; 5] = ["spx", "cpx", "dpx", "qpx", "tpx"];
const PARTITION_MEMORY_MODES: [&str; 2] = ["nps1", "nps4"];
const DRI_PATH: &str = "/dev/dri";

/// Node agents deployed per DeviceConfig, matched as `<dc>-<agent>` name prefixes
const NODE_AGENTS: [&str; 5] = [
    "metrics-exporter",
    "device-config-manager",
    "device-plugin",
    "node-labeller",
    "test-runner",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Evict,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSettings {
    pub mode: DrainMode,
    /// Also remove pods that no controller will recreate
    pub force: bool,
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// `None` uses each pod's own grace period
    pub grace_period: Option<u32>,
    pub ignore_namespaces: Vec<String>,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            mode: DrainMode::Evict,
            force: false,
            timeout: None,
            grace_period: None,
            ignore_namespaces: Vec::new(),
        }
    }
}

fn timeout_from_seconds(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

fn grace_from_seconds(seconds: i64) -> Option<u32> {
    u32::try_from(seconds).ok()
}

impl DrainSettings {
    /// A drain policy wins over a deletion policy; neither means a plain evict.
    pub fn from_policy(policy: &UpgradePolicySpec) -> Self {
        if let Some(drain) = &policy.node_drain_policy {
            return Self {
                mode: DrainMode::Evict,
                force: drain.force.unwrap_or(false),
                timeout: timeout_from_seconds(drain.timeout_seconds),
                grace_period: grace_from_seconds(drain.grace_period_seconds),
                ignore_namespaces: drain.ignore_namespaces.clone(),
            };
        }
        if let Some(deletion) = &policy.pod_deletion_policy {
            return Self {
                mode: DrainMode::Delete,
                force: deletion.force.unwrap_or(false),
                timeout: timeout_from_seconds(deletion.timeout_seconds),
                grace_period: grace_from_seconds(deletion.grace_period_seconds),
                ignore_namespaces: Vec::new(),
            };
        }
        Self::default()
    }
}

/// `amd.com/gpu` or a partition resource such as `amd.com/cpx_nps4`
pub fn is_gpu_resource(name: &str) -> bool {
    if name == GPU_RESOURCE {
        return true;
    }
    name.strip_prefix("amd.com/")
        .and_then(|rest| rest.split_once('_'))
        .is_some_and(|(compute, memory)| {
            PARTITION_COMPUTE_MODES.contains(&compute) && PARTITION_MEMORY_MODES.contains(&memory)
        })
}

fn uses_gpu(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers.iter().any(|container| {
        let resources = container.resources.as_ref();
        let requested = resources
            .and_then(|r| r.requests.as_ref())
            .into_iter()
            .chain(resources.and_then(|r| r.limits.as_ref()))
            .flat_map(|quantities| quantities.keys())
            .any(|name| is_gpu_resource(name));
        let mounts_dri = container
            .volume_mounts
            .iter()
            .flatten()
            .any(|mount| mount.mount_path.starts_with(DRI_PATH));
        requested || mounts_dri
    })
}

fn is_node_agent(pod: &Pod, dc_name: &str) -> bool {
    let name = pod.name_any();
    NODE_AGENTS
        .iter()
        .any(|agent| name.starts_with(&format!("{dc_name}-{agent}")))
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

fn has_controller(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.controller.unwrap_or(false))
}

/// Pods on the node that must leave before the driver is swapped
pub fn select_pods(pods: Vec<Pod>, dc_name: &str, settings: &DrainSettings) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| !is_finished(pod))
        .filter(|pod| {
            let namespace = pod.namespace().unwrap_or_default();
            !settings.ignore_namespaces.contains(&namespace)
        })
        .filter(|pod| is_node_agent(pod, dc_name) || uses_gpu(pod))
        .collect()
}

fn drain_error(node: &str, reason: impl Into<String>) -> Error {
    Error::DrainError {
        node: node.to_string(),
        reason: reason.into(),
    }
}

/// Evict or delete the GPU pods on `node` and wait for them to terminate.
///
/// Returns `Ok(WaitOutcome::Cancelled)` when `token` fires mid-drain; a
/// timeout or a refused removal is a [`Error::DrainError`].
pub async fn drain_node(
    client: &dyn ClusterClient,
    dc_name: &str,
    node: &str,
    settings: &DrainSettings,
    poll_interval: Duration,
    token: &CancellationToken,
) -> Result<WaitOutcome> {
    let pods = select_pods(client.list_pods_on_node(node).await?, dc_name, settings);
    if pods.is_empty() {
        debug!(node = %node, "No GPU pods to drain");
        return Ok(WaitOutcome::Satisfied);
    }

    if !settings.force {
        let unmanaged: Vec<String> = pods
            .iter()
            .filter(|pod| !has_controller(pod))
            .map(|pod| format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()))
            .collect();
        if !unmanaged.is_empty() {
            return Err(drain_error(
                node,
                format!("pods without a controller require force: {}", unmanaged.join(", ")),
            ));
        }
    }

    info!(node = %node, pods = pods.len(), mode = ?settings.mode, "Draining GPU pods");
    let started = Instant::now();
    let deadline = settings.timeout.and_then(|t| started.checked_add(t));

    let mut pending: Vec<(String, String)> = pods
        .iter()
        .map(|pod| (pod.namespace().unwrap_or_default(), pod.name_any()))
        .collect();
    loop {
        let mut blocked = Vec::new();
        for (namespace, name) in pending {
            let result = match settings.mode {
                DrainMode::Evict => client.evict_pod(&namespace, &name, settings.grace_period).await,
                DrainMode::Delete => client.delete_pod(&namespace, &name, settings.grace_period).await,
            };
            match result {
                Ok(()) => debug!(node = %node, pod = %name, "Pod removal accepted"),
                Err(e) if e.is_too_many_requests() => {
                    debug!(node = %node, pod = %name, "Eviction blocked by disruption budget");
                    blocked.push((namespace, name));
                }
                Err(e) => return Err(drain_error(node, format!("{namespace}/{name}: {e}"))),
            }
        }
        if blocked.is_empty() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(drain_error(
                node,
                format!("timed out waiting for {} eviction(s)", blocked.len()),
            ));
        }
        tokio::select! {
            () = token.cancelled() => return Ok(WaitOutcome::Cancelled),
            () = tokio::time::sleep(poll_interval) => {}
        }
        pending = blocked;
    }

    let targets: HashSet<String> = pods.iter().filter_map(|pod| pod.uid()).collect();
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    let schedule = match remaining {
        Some(timeout) => PollSchedule::new(poll_interval, timeout),
        None => PollSchedule::unbounded(poll_interval),
    };
    let targets = &targets;
    let outcome = poll_until(schedule, token, move || async move {
        match client.list_pods_on_node(node).await {
            Ok(pods) => !pods
                .iter()
                .any(|pod| pod.uid().is_some_and(|uid| targets.contains(&uid))),
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to list pods while draining");
                false
            }
        }
    })
    .await;

    match outcome {
        WaitOutcome::TimedOut => Err(drain_error(node, "timed out waiting for pods to terminate")),
        other => {
            if other == WaitOutcome::Satisfied {
                info!(node = %node, "Drain complete");
            }
            Ok(other)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{dri_pod, gpu_pod, pod};
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::crds::deviceconfig::{DrainSpec, PodDeletionSpec};

    #[test]
    fn recognises_gpu_and_partition_resources() {
        assert!(is_gpu_resource("amd.com/gpu"));
        assert!(is_gpu_resource("amd.com/cpx_nps4"));
        assert!(is_gpu_resource("amd.com/spx_nps1"));
        assert!(!is_gpu_resource("amd.com/cpx_nps2"));
        assert!(!is_gpu_resource("nvidia.com/gpu"));
        assert!(!is_gpu_resource("cpu"));
    }

    #[test]
    fn selects_gpu_consumers_and_node_agents_only() {
        let pods = vec![
            gpu_pod("ml", "trainer", "n1", "amd.com/gpu"),
            gpu_pod("ml", "partitioned", "n1", "amd.com/qpx_nps1"),
            dri_pod("ml", "renderer", "n1"),
            pod("gpu", "dc-metrics-exporter-x7k2p", "n1"),
            pod("gpu", "other-metrics-exporter-abc", "n1"),
            pod("web", "nginx", "n1"),
            gpu_pod("kube-system", "system-gpu", "n1", "amd.com/gpu"),
        ];
        let settings = DrainSettings {
            ignore_namespaces: vec!["kube-system".to_string()],
            ..DrainSettings::default()
        };

        let names: Vec<String> = select_pods(pods, "dc", &settings)
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        assert_eq!(
            names,
            vec!["trainer", "partitioned", "renderer", "dc-metrics-exporter-x7k2p"]
        );
    }

    #[test]
    fn settings_follow_policy_precedence() {
        let mut policy = UpgradePolicySpec::default();
        assert_eq!(DrainSettings::from_policy(&policy), DrainSettings::default());

        policy.pod_deletion_policy = Some(PodDeletionSpec {
            force: Some(true),
            timeout_seconds: 30,
            grace_period_seconds: -1,
        });
        let settings = DrainSettings::from_policy(&policy);
        assert_eq!(settings.mode, DrainMode::Delete);
        assert!(settings.force);
        assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.grace_period, None);

        policy.node_drain_policy = Some(DrainSpec {
            force: None,
            timeout_seconds: 0,
            grace_period_seconds: 10,
            ignore_daemon_sets: Some(true),
            ignore_namespaces: vec![],
        });
        let settings = DrainSettings::from_policy(&policy);
        assert_eq!(settings.mode, DrainMode::Evict);
        assert!(!settings.force);
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.grace_period, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_gpu_pods_and_leaves_others() {
        let fake = FakeCluster::new();
        fake.put_pod(gpu_pod("ml", "trainer", "n1", "amd.com/gpu"));
        fake.put_pod(pod("web", "nginx", "n1"));
        fake.put_pod(gpu_pod("ml", "elsewhere", "n2", "amd.com/gpu"));

        let outcome = drain_node(
            &fake,
            "dc",
            "n1",
            &DrainSettings::default(),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, WaitOutcome::Satisfied);
        assert_eq!(fake.log(), vec!["evict ml/trainer"]);
        assert!(fake.has_pod("web", "nginx"));
        assert!(fake.has_pod("ml", "elsewhere"));
    }

    #[tokio::test]
    async fn unmanaged_pod_without_force_fails() {
        let fake = FakeCluster::new();
        let mut bare = gpu_pod("ml", "bare", "n1", "amd.com/gpu");
        bare.metadata.owner_references = None;
        fake.put_pod(bare);

        let err = drain_node(
            &fake,
            "dc",
            "n1",
            &DrainSettings::default(),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::DrainError { .. }));
        assert!(fake.has_pod("ml", "bare"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_eviction_times_out() {
        let fake = FakeCluster::new();
        fake.put_pod(gpu_pod("ml", "trainer", "n1", "amd.com/gpu"));
        fake.state().eviction_blocked.insert("trainer".to_string());
        let settings = DrainSettings {
            timeout: Some(Duration::from_secs(60)),
            ..DrainSettings::default()
        };

        let err = drain_node(
            &fake,
            "dc",
            "n1",
            &settings,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_a_blocked_drain() {
        let fake = FakeCluster::new();
        fake.put_pod(gpu_pod("ml", "trainer", "n1", "amd.com/gpu"));
        fake.state().eviction_blocked.insert("trainer".to_string());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = drain_node(
            &fake,
            "dc",
            "n1",
            &DrainSettings::default(),
            Duration::from_secs(5),
            &token,
        )
        .await
        .unwrap();

        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_mode_deletes_instead_of_evicting() {
        let fake = FakeCluster::new();
        fake.put_pod(dri_pod("ml", "renderer", "n1"));
        let settings = DrainSettings {
            mode: DrainMode::Delete,
            ..DrainSettings::default()
        };

        drain_node(
            &fake,
            "dc",
            "n1",
            &settings,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(fake.log(), vec!["delete pod ml/renderer"]);
    }
}
