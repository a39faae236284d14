//! Recovery policy bookkeeping.
//!
//! Workflow start times per `(node, condition)`. The in-memory tracker is
//! rebuilt from the `RemediationWorkflowStatus` resource every pass, so the
//! resource is the source of truth and the tracker only answers counts.

use crate::clock::parse_timestamp;
use crate::crds::RemediationAttempts;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, warn};

type Key = (String, String);

fn key(node: &str, condition: &str) -> Key {
    (node.to_string(), condition.to_string())
}

#[derive(Debug, Default)]
pub struct RecoveryTracker {
    attempts: DashMap<Key, Vec<DateTime<Utc>>>,
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, node: &str, condition: &str) -> usize {
        self.attempts.get(&key(node, condition)).map_or(0, |a| a.len())
    }

    /// Whether `node` already used its `max_runs` for `condition`.
    pub fn is_violated(&self, node: &str, condition: &str, max_runs: u32) -> bool {
        let count = self.count(node, condition);
        debug!(node = %node, condition = %condition, count, max_runs, "Recovery attempts in window");
        count >= max_runs as usize
    }

    /// Forget attempts that started more than `window` before `now`.
    pub fn drop_older_than(&self, node: &str, condition: &str, window: Duration, now: DateTime<Utc>) {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some(mut attempts) = self.attempts.get_mut(&key(node, condition)) {
            attempts.retain(|at| *at > cutoff);
        }
    }

    pub fn register(&self, node: &str, condition: &str, at: DateTime<Utc>) {
        self.attempts.entry(key(node, condition)).or_default().push(at);
    }

    /// Replace everything with the attempts recorded in the status resource.
    pub fn sync_from(&self, recorded: &RemediationAttempts) {
        self.attempts.clear();
        for (node, conditions) in recorded {
            for (condition, attempts) in conditions {
                let times = attempts
                    .iter()
                    .filter_map(|a| {
                        let parsed = parse_timestamp(&a.start_time);
                        if parsed.is_none() {
                            warn!(node = %node, workflow = %a.name, start = %a.start_time, "Unparseable attempt time, ignoring");
                        }
                        parsed
                    })
                    .collect();
                self.attempts.insert(key(node, condition), times);
            }
        }
    }
}

/// Remove attempts that started before `cutoff` (or whose start time cannot
/// be read) and empty branches. Returns whether anything was removed.
pub fn prune_attempts(recorded: &mut RemediationAttempts, cutoff: DateTime<Utc>) -> bool {
    let mut changed = false;
    recorded.retain(|_, conditions| {
        conditions.retain(|_, attempts| {
            let before = attempts.len();
            attempts.retain(|a| parse_timestamp(&a.start_time).is_some_and(|at| at > cutoff));
            changed |= attempts.len() != before;
            !attempts.is_empty()
        });
        !conditions.is_empty()
    });
    changed
}
