//! Dependency scheduler: picks the next executable phase and its runnable
//! subtasks from the plan and the checkpoint.

use crate::checkpoint::Checkpoint;
use crate::dag::builder::{DagBuilder, PhaseGraph};
use crate::errors::PlanIntegrityError;
use crate::plan::{Phase, Plan, Subtask, SubtaskStatus};
use serde::{Deserialize, Serialize};

/// How the executor may dispatch a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Fan out under the global concurrency bound
    Parallel,
    /// Strictly one at a time, in declaration order
    Sequential,
}

/// Runnable subtasks of one phase, in declaration order.
#[derive(Debug, Clone)]
pub struct SubtaskBatch {
    pub phase_id: String,
    pub subtasks: Vec<Subtask>,
    pub mode: DispatchMode,
}

impl SubtaskBatch {
    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn is_sequential(&self) -> bool {
        self.mode == DispatchMode::Sequential
    }

    pub fn ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.id.clone()).collect()
    }
}

/// A phase that cannot start because some dependencies never resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedPhase {
    pub phase: String,
    pub waiting_on: Vec<String>,
}

/// Selects runnable work given the plan and checkpoint state.
#[derive(Debug, Clone)]
pub struct DependencyScheduler {
    graph: PhaseGraph,
}

impl DependencyScheduler {
    /// Validate the plan structure and build the scheduler.
    pub fn new(plan: &Plan) -> Result<Self, PlanIntegrityError> {
        let graph = DagBuilder::new(&plan.phases).build()?;
        Ok(Self { graph })
    }

    /// First phase, in declaration order, that still has work and whose
    /// dependencies are all resolved.
    ///
    /// A phase the checkpoint marks successful is skipped unless
    /// `force_refresh` is set. A dependency counts as resolved when the
    /// checkpoint marks it successful or every one of its subtasks is
    /// `completed` in the in-memory plan.
    pub fn next_runnable_phase<'p>(
        &self,
        plan: &'p Plan,
        checkpoint: Option<&Checkpoint>,
        force_refresh: bool,
    ) -> Option<&'p Phase> {
        plan.phases.iter().find(|phase| {
            self.has_work(phase, checkpoint, force_refresh)
                && self
                    .dependencies_of(&phase.id)
                    .into_iter()
                    .all(|dep| Self::dependency_resolved(plan, dep, checkpoint, force_refresh))
        })
    }

    /// Phases that still have work but wait on unresolved dependencies.
    pub fn blocked_phases(
        &self,
        plan: &Plan,
        checkpoint: Option<&Checkpoint>,
        force_refresh: bool,
    ) -> Vec<BlockedPhase> {
        plan.phases
            .iter()
            .filter(|phase| self.has_work(phase, checkpoint, force_refresh))
            .filter_map(|phase| {
                let waiting_on: Vec<String> = self
                    .dependencies_of(&phase.id)
                    .into_iter()
                    .filter(|dep| !Self::dependency_resolved(plan, dep, checkpoint, force_refresh))
                    .map(String::from)
                    .collect();
                if waiting_on.is_empty() {
                    None
                } else {
                    Some(BlockedPhase {
                        phase: phase.id.clone(),
                        waiting_on,
                    })
                }
            })
            .collect()
    }

    /// All `pending` subtasks of the phase, tagged sequential-only unless the
    /// phase is parallel-safe and has at least two of them.
    pub fn runnable_subtasks(phase: &Phase) -> SubtaskBatch {
        let subtasks: Vec<Subtask> = phase
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Pending)
            .cloned()
            .collect();

        let mode = if phase.parallel_safe && subtasks.len() >= 2 {
            DispatchMode::Parallel
        } else {
            DispatchMode::Sequential
        };

        SubtaskBatch {
            phase_id: phase.id.clone(),
            subtasks,
            mode,
        }
    }

    /// Dependency ids of a phase, as validated into the graph.
    fn dependencies_of(&self, phase_id: &str) -> Vec<&str> {
        self.graph
            .get_index(phase_id)
            .map(|index| {
                self.graph
                    .dependencies(index)
                    .iter()
                    .filter_map(|&dep| self.graph.id(dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_work(&self, phase: &Phase, checkpoint: Option<&Checkpoint>, force_refresh: bool) -> bool {
        if !force_refresh && checkpoint.is_some_and(|c| c.is_phase_complete(&phase.id)) {
            return false;
        }
        !phase.is_terminal()
    }

    fn dependency_resolved(
        plan: &Plan,
        dep: &str,
        checkpoint: Option<&Checkpoint>,
        force_refresh: bool,
    ) -> bool {
        if !force_refresh && checkpoint.is_some_and(|c| c.is_phase_complete(dep)) {
            return true;
        }
        plan.phase(dep).is_some_and(|p| p.is_resolved())
    }
}
