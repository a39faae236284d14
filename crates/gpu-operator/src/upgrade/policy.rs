//! Upgrade Policy Engine.

use crate::crds::UpgradePolicySpec;
use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Result of evaluating the policy for one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Nodes allowed in flight at once after subtracting failed nodes
    pub allowed: i64,
    pub violated: bool,
}

impl PolicyDecision {
    /// Candidates that may be admitted this pass
    pub fn admissible(&self, in_progress: usize) -> usize {
        if self.violated {
            return 0;
        }
        usize::try_from(self.allowed - count(in_progress)).unwrap_or(0)
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Resolve `maxUnavailableNodes` against the fleet size. Percentages round up.
pub fn resolve_max_unavailable(value: &IntOrString, total: usize) -> Result<i64> {
    match value {
        IntOrString::Int(n) => Ok(i64::from(*n)),
        IntOrString::String(s) => {
            let trimmed = s.trim();
            if let Some(pct) = trimmed.strip_suffix('%') {
                let pct: i64 = pct
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidPolicy(format!("maxUnavailableNodes '{s}' is not a percentage")))?;
                if pct < 0 {
                    return Err(Error::InvalidPolicy(format!("maxUnavailableNodes '{s}' is negative")));
                }
                let total = count(total);
                Ok((pct * total + 99) / 100)
            } else {
                trimmed
                    .parse()
                    .map_err(|_| Error::InvalidPolicy(format!("maxUnavailableNodes '{s}' is not a count or percentage")))
            }
        }
    }
}

/// Decide whether more upgrades may start given the current counts.
pub fn evaluate(
    policy: &UpgradePolicySpec,
    total: usize,
    in_progress: usize,
    failed: usize,
) -> Result<PolicyDecision> {
    let max_unavailable = resolve_max_unavailable(&policy.max_unavailable_nodes, total)?;
    let remaining = max_unavailable - count(failed);
    let allowed = if policy.max_parallel_upgrades == 0 {
        remaining
    } else {
        remaining.min(i64::from(policy.max_parallel_upgrades))
    };
    let violated = allowed <= 0 || count(in_progress) >= allowed;
    Ok(PolicyDecision { allowed, violated })
}
