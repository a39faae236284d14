//! Fleet State Store.
//!
//! Per-node upgrade phase, start time and last known boot id, shared by the
//! Upgrade Manager and every in-flight node worker. Entries are sharded by
//! `DashMap`; each update takes only the shard lock of one node.

use crate::crds::UpgradePhase;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEntry {
    pub phase: UpgradePhase,
    pub started_at: Option<DateTime<Utc>>,
    pub boot_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct FleetStateStore {
    nodes: DashMap<String, NodeEntry>,
}

impl FleetStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, node: &str) -> UpgradePhase {
        self.nodes.get(node).map(|e| e.phase).unwrap_or_default()
    }

    /// Whether the store has ever seen `node`
    pub fn knows(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Set the phase if it differs; returns whether it changed.
    pub fn set_phase(&self, node: &str, phase: UpgradePhase) -> bool {
        let mut entry = self.nodes.entry(node.to_string()).or_default();
        if entry.phase == phase {
            return false;
        }
        info!(node = %node, from = %entry.phase, to = %phase, "Upgrade state transition");
        entry.phase = phase;
        true
    }

    /// Move `node` from `expected` to `phase`; no-op when the current phase
    /// is anything else.
    pub fn compare_and_set(&self, node: &str, expected: UpgradePhase, phase: UpgradePhase) -> bool {
        let mut entry = self.nodes.entry(node.to_string()).or_default();
        if entry.phase != expected || entry.phase == phase {
            return false;
        }
        info!(node = %node, from = %entry.phase, to = %phase, "Upgrade state transition");
        entry.phase = phase;
        true
    }

    pub fn started_at(&self, node: &str) -> Option<DateTime<Utc>> {
        self.nodes.get(node).and_then(|e| e.started_at)
    }

    pub fn set_started_at(&self, node: &str, at: DateTime<Utc>) {
        self.nodes.entry(node.to_string()).or_default().started_at = Some(at);
    }

    pub fn clear_started_at(&self, node: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node) {
            entry.started_at = None;
        }
    }

    pub fn boot_id(&self, node: &str) -> Option<String> {
        self.nodes.get(node).and_then(|e| e.boot_id.clone())
    }

    pub fn set_boot_id(&self, node: &str, boot_id: &str) {
        self.nodes.entry(node.to_string()).or_default().boot_id = Some(boot_id.to_string());
    }

    pub fn entry(&self, node: &str) -> Option<NodeEntry> {
        self.nodes.get(node).map(|e| e.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, NodeEntry> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn forget(&self, node: &str) {
        self.nodes.remove(node);
    }
}
