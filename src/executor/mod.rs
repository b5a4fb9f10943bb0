//! Plan execution.
//!
//! ## Architecture
//!
//! 1. **Orchestrator** - Asks the [`DependencyScheduler`](crate::dag::DependencyScheduler)
//!    for the next runnable phase, runs it, and decides how the run ends
//! 2. **PhaseExecutor** - Dispatches a phase's subtasks within the
//!    concurrency bound, gated by the rate-limit controller, and routes each
//!    outcome to the recovery manager and checkpoint store
//! 3. **Events** - Optional [`OrchestratorEvent`] channel for observers

mod orchestrator;
mod phase;
mod state;

pub use orchestrator::Orchestrator;
pub use phase::{ExecutorConfig, PhaseExecutor};
pub use state::{OrchestratorEvent, PhaseResult, RunOutcome};

use crate::checkpoint::CheckpointStore;
use crate::plan::{Plan, PlanStore};
use crate::recovery::RecoveryManager;

/// Mutable state of one run, owned by the driver.
#[derive(Debug)]
pub struct RunContext {
    pub plan: Plan,
    /// Where plan status updates are persisted; `None` keeps them in memory
    pub plan_store: Option<PlanStore>,
    pub recovery: RecoveryManager,
    pub checkpoint: CheckpointStore,
}

impl RunContext {
    pub fn new(plan: Plan, recovery: RecoveryManager, checkpoint: CheckpointStore) -> Self {
        Self {
            plan,
            plan_store: None,
            recovery,
            checkpoint,
        }
    }

    pub fn with_plan_store(mut self, store: PlanStore) -> Self {
        self.plan_store = Some(store);
        self
    }

    /// Persist the plan if it has a backing store.
    pub fn save_plan(&self) -> anyhow::Result<()> {
        match &self.plan_store {
            Some(store) => store.save(&self.plan),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests;
