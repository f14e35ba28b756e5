//! Capability gate and the gated agent wrapper.
//!
//! Every side-effecting call is checked in a fixed order: is the capability
//! declared, is there budget left. Only then is the counter bumped and the
//! call handed to the real agent.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::budget::OperationBudget;
use super::capability::Capability;
use super::control::RunControl;
use super::error::{SandboxError, SandboxResult};
use crate::agent::{
    AgentControl, AgentEvent, AgentState, BlockInfo, ItemStack, NavOutcome, NavigateOptions,
};
use crate::geometry::{BlockPos, Position};
use crate::metrics::METRICS;
use crate::obs;

/// Declared capabilities plus the run's operation budget.
#[derive(Debug)]
pub struct CapabilityGate {
    declared: BTreeSet<Capability>,
    budget: OperationBudget,
}

impl CapabilityGate {
    pub fn new(declared: BTreeSet<Capability>, budget: OperationBudget) -> Self {
        Self { declared, budget }
    }

    pub fn is_declared(&self, capability: Capability) -> bool {
        self.declared.contains(&capability)
    }

    pub fn declared(&self) -> &BTreeSet<Capability> {
        &self.declared
    }

    pub fn budget(&self) -> &OperationBudget {
        &self.budget
    }

    /// Admit one call of `operation` under `capability`, consuming budget.
    pub fn admit(&self, capability: Capability, operation: &str) -> SandboxResult<()> {
        if !self.is_declared(capability) {
            METRICS.inc_capability_denials();
            obs::emit_gate_rejected(capability, operation, "not declared");
            return Err(SandboxError::CapabilityDenied { capability });
        }
        match self.budget.try_consume(capability) {
            Ok(_) => {
                METRICS.inc_gated_calls();
                Ok(())
            }
            Err(err) => {
                METRICS.inc_budget_rejections();
                obs::emit_gate_rejected(capability, operation, "budget exhausted");
                Err(err)
            }
        }
    }
}

/// [`AgentControl`] wrapper that enforces the gate and the run deadlines.
pub struct GatedAgent {
    inner: Arc<dyn AgentControl>,
    gate: Arc<CapabilityGate>,
    control: Arc<RunControl>,
}

impl GatedAgent {
    pub fn new(
        inner: Arc<dyn AgentControl>,
        gate: Arc<CapabilityGate>,
        control: Arc<RunControl>,
    ) -> Self {
        Self {
            inner,
            gate,
            control,
        }
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    fn enter(&self, capability: Capability, operation: &str) -> SandboxResult<()> {
        self.control.check()?;
        self.gate.admit(capability, operation)
    }
}

#[async_trait]
impl AgentControl for GatedAgent {
    async fn get_state(&self) -> SandboxResult<AgentState> {
        self.control.bound(self.inner.get_state()).await
    }

    async fn scan_blocks(
        &self,
        kinds: &[String],
        radius: u32,
        max: usize,
    ) -> SandboxResult<Vec<BlockInfo>> {
        self.control
            .bound(self.inner.scan_blocks(kinds, radius, max))
            .await
    }

    async fn block_at(&self, pos: BlockPos) -> SandboxResult<Option<BlockInfo>> {
        self.control.bound(self.inner.block_at(pos)).await
    }

    async fn navigate_to(
        &self,
        target: Position,
        opts: &NavigateOptions,
    ) -> SandboxResult<NavOutcome> {
        self.enter(Capability::Move, "navigate_to")?;
        self.control
            .bound(self.inner.navigate_to(target, opts))
            .await
    }

    async fn interact(&self, pos: BlockPos) -> SandboxResult<Value> {
        self.enter(Capability::Dig, "interact")?;
        self.control.bound(self.inner.interact(pos)).await
    }

    async fn mine(&self, pos: BlockPos) -> SandboxResult<Value> {
        self.enter(Capability::Dig, "mine")?;
        self.control.bound(self.inner.mine(pos)).await
    }

    async fn place(&self, pos: BlockPos, item: &str) -> SandboxResult<Value> {
        self.enter(Capability::Place, "place")?;
        self.control.bound(self.inner.place(pos, item)).await
    }

    async fn craft(&self, item: &str, count: u32) -> SandboxResult<Value> {
        self.enter(Capability::Craft, "craft")?;
        self.control.bound(self.inner.craft(item, count)).await
    }

    async fn equip(&self, item: &str, slot: &str) -> SandboxResult<Value> {
        self.enter(Capability::Inventory, "equip")?;
        self.control.bound(self.inner.equip(item, slot)).await
    }

    async fn get_inventory(&self) -> SandboxResult<Vec<ItemStack>> {
        self.enter(Capability::Inventory, "get_inventory")?;
        self.control.bound(self.inner.get_inventory()).await
    }

    fn subscribe(&self) -> SandboxResult<broadcast::Receiver<AgentEvent>> {
        self.enter(Capability::Events, "subscribe")?;
        self.inner.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimulatedAgent;
    use crate::sandbox::budget::BudgetLimits;
    use std::time::Duration;

    fn gated(caps: &[Capability], limits: BudgetLimits) -> (Arc<SimulatedAgent>, GatedAgent) {
        let sim = Arc::new(SimulatedAgent::default());
        let gate = Arc::new(CapabilityGate::new(
            caps.iter().copied().collect(),
            OperationBudget::new(&limits),
        ));
        let control = Arc::new(RunControl::new(Duration::from_secs(5)));
        (sim.clone(), GatedAgent::new(sim, gate, control))
    }

    #[tokio::test]
    async fn test_undeclared_capability_is_denied() {
        let (sim, agent) = gated(&[Capability::Move], BudgetLimits::default());
        let err = agent.mine(BlockPos::new(0, 0, 1)).await.unwrap_err();
        assert_eq!(
            err,
            SandboxError::CapabilityDenied {
                capability: Capability::Dig
            }
        );
        assert_eq!(sim.calls_to("mine").await, 0);
    }

    #[tokio::test]
    async fn test_budget_blocks_before_delegating() {
        let limits = BudgetLimits::default().with_limit(Capability::Move, 2);
        let (sim, agent) = gated(&[Capability::Move], limits);
        let opts = NavigateOptions::default();
        for x in 1..=2 {
            agent
                .navigate_to(Position::new(x as f64, 0.0, 0.0), &opts)
                .await
                .unwrap();
        }
        let err = agent
            .navigate_to(Position::new(3.0, 0.0, 0.0), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExceeded { limit: 2, .. }));
        assert_eq!(sim.calls_to("navigate_to").await, 2);
        assert_eq!(agent.gate().budget().used(Capability::Move), 2);
    }

    #[tokio::test]
    async fn test_reads_are_not_budgeted() {
        let limits = BudgetLimits::default().with_limit(Capability::Move, 0);
        let (_sim, agent) = gated(&[], limits);
        for _ in 0..5 {
            agent.get_state().await.unwrap();
            agent.scan_blocks(&[], 4, 10).await.unwrap();
        }
    }
}
