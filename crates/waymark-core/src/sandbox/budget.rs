//! Per-run operation budgets.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::error::{SandboxError, SandboxResult};

/// Configured call quotas per capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Quota for every capability without an override.
    pub default_max: u32,
    pub overrides: BTreeMap<Capability, u32>,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            default_max: 500,
            overrides: BTreeMap::new(),
        }
    }
}

impl BudgetLimits {
    pub fn limit(&self, capability: Capability) -> u32 {
        self.overrides
            .get(&capability)
            .copied()
            .unwrap_or(self.default_max)
    }

    pub fn with_limit(mut self, capability: Capability, max: u32) -> Self {
        self.overrides.insert(capability, max);
        self
    }

    /// Apply per-program limits. A program can only lower a quota.
    pub fn tightened(&self, requested: &BTreeMap<Capability, u32>) -> Self {
        let mut out = self.clone();
        for (&cap, &max) in requested {
            let current = self.limit(cap);
            out.overrides.insert(cap, max.min(current));
        }
        out
    }
}

/// Atomic per-capability counters for one run.
#[derive(Debug)]
pub struct OperationBudget {
    limits: [u32; 6],
    used: [AtomicU32; 6],
}

impl OperationBudget {
    pub fn new(limits: &BudgetLimits) -> Self {
        Self {
            limits: Capability::ALL.map(|cap| limits.limit(cap)),
            used: Default::default(),
        }
    }

    /// Count one call against `capability`. Fails without counting once the
    /// quota is reached. Returns the number of calls used so far.
    pub fn try_consume(&self, capability: Capability) -> SandboxResult<u32> {
        let idx = capability.index();
        let limit = self.limits[idx];
        self.used[idx]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| SandboxError::BudgetExceeded { capability, limit })
    }

    pub fn used(&self, capability: Capability) -> u32 {
        self.used[capability.index()].load(Ordering::Acquire)
    }

    pub fn limit(&self, capability: Capability) -> u32 {
        self.limits[capability.index()]
    }

    pub fn remaining(&self, capability: Capability) -> u32 {
        self.limit(capability).saturating_sub(self.used(capability))
    }

    /// Usage for the given capabilities.
    pub fn usage<'a>(
        &self,
        capabilities: impl IntoIterator<Item = &'a Capability>,
    ) -> BTreeMap<Capability, u32> {
        capabilities
            .into_iter()
            .map(|&cap| (cap, self.used(cap)))
            .collect()
    }
}
