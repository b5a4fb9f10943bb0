//! Plan, phase and subtask types.

use crate::dag::DagBuilder;
use crate::errors::PlanIntegrityError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a single subtask.
///
/// `Completed` and `Escalated` are terminal. `Failed` marks an attempt that
/// failed and is waiting to be re-enqueued in the next dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl SubtaskStatus {
    /// Check if the subtask is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Escalated)
    }

    /// Check if the subtask completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::InProgress => write!(f, "in_progress"),
            SubtaskStatus::Completed => write!(f, "completed"),
            SubtaskStatus::Failed => write!(f, "failed"),
            SubtaskStatus::Escalated => write!(f, "escalated"),
        }
    }
}

/// The smallest unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subtask {
    /// Stable id, unique within the plan
    pub id: String,
    /// Free-form description handed to the execution backend
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    /// Id of the owning phase. Filled in when the plan is linked.
    #[serde(skip)]
    pub phase_id: String,
    /// Error summary of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// References to outputs produced by the successful attempt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_refs: Vec<String>,
    /// Escalation artifact written when the subtask exhausted its retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<PathBuf>,
}

impl Subtask {
    /// Create a pending subtask.
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            status: SubtaskStatus::Pending,
            phase_id: String::new(),
            last_error: None,
            output_refs: Vec::new(),
            escalation: None,
        }
    }
}

/// A dependency-ordered group of subtasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Stable phase id (e.g. "P1")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Ids of phases that must fully resolve before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether subtasks may be dispatched concurrently
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl Phase {
    /// Create a phase without subtasks.
    pub fn new(id: &str, name: &str, depends_on: Vec<String>, parallel_safe: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            depends_on,
            parallel_safe,
            subtasks: Vec::new(),
        }
    }

    /// Append a pending subtask owned by this phase.
    pub fn with_subtask(mut self, id: &str, description: &str) -> Self {
        let mut subtask = Subtask::new(id, description);
        subtask.phase_id = self.id.clone();
        self.subtasks.push(subtask);
        self
    }

    /// True when every subtask completed successfully.
    pub fn is_resolved(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_success())
    }

    /// True when every subtask reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_terminal())
    }

    /// Number of subtasks with the given status.
    pub fn count(&self, status: SubtaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Output references of all completed subtasks, in declaration order.
    pub fn output_refs(&self) -> Vec<String> {
        self.subtasks
            .iter()
            .filter(|s| s.status.is_success())
            .flat_map(|s| s.output_refs.iter().cloned())
            .collect()
    }
}

/// Counts of subtasks by status across a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
}

/// The full unit of work: an ordered list of phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    pub phases: Vec<Phase>,
}

impl Plan {
    /// Create a plan and link every subtask to its owning phase.
    pub fn new(phases: Vec<Phase>) -> Self {
        let mut plan = Self { phases };
        plan.link_subtasks();
        plan
    }

    /// Fill in the back-reference from each subtask to its phase.
    pub fn link_subtasks(&mut self) {
        for phase in &mut self.phases {
            for subtask in &mut phase.subtasks {
                subtask.phase_id = phase.id.clone();
            }
        }
    }

    /// Validate dependency structure and id uniqueness.
    pub fn validate(&self) -> Result<(), PlanIntegrityError> {
        DagBuilder::new(&self.phases).build().map(|_| ())
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.phases.iter().find_map(|p| p.subtask(id))
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.phases.iter_mut().find_map(|p| p.subtask_mut(id))
    }

    /// Update a subtask's status. Returns false if the subtask does not exist.
    pub fn set_status(&mut self, subtask_id: &str, status: SubtaskStatus) -> bool {
        match self.subtask_mut(subtask_id) {
            Some(subtask) => {
                subtask.status = status;
                true
            }
            None => false,
        }
    }

    /// True when every phase is fully resolved.
    pub fn all_resolved(&self) -> bool {
        self.phases.iter().all(|p| p.is_resolved())
    }

    /// Ids of escalated subtasks, in declaration order.
    pub fn escalated_subtasks(&self) -> Vec<String> {
        self.phases
            .iter()
            .flat_map(|p| p.subtasks.iter())
            .filter(|s| s.status == SubtaskStatus::Escalated)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Revert subtasks left `in_progress` by an interrupted run to `pending`.
    ///
    /// No attempt was recorded for an interrupted dispatch, so the retry
    /// budget is untouched. Returns the ids that were reverted.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut reverted = Vec::new();
        for subtask in self.phases.iter_mut().flat_map(|p| p.subtasks.iter_mut()) {
            if subtask.status == SubtaskStatus::InProgress {
                subtask.status = SubtaskStatus::Pending;
                reverted.push(subtask.id.clone());
            }
        }
        reverted
    }

    /// Return completed and failed subtasks of one phase to `pending`,
    /// dropping their outputs. Escalated subtasks keep their status; their
    /// fate belongs to the attempt history. Returns the ids that changed.
    pub fn reset_phase(&mut self, phase_id: &str) -> Vec<String> {
        let Some(phase) = self.phase_mut(phase_id) else {
            return Vec::new();
        };
        let mut reset = Vec::new();
        for subtask in phase.subtasks.iter_mut() {
            if matches!(subtask.status, SubtaskStatus::Completed | SubtaskStatus::Failed) {
                subtask.status = SubtaskStatus::Pending;
                subtask.last_error = None;
                subtask.output_refs.clear();
                reset.push(subtask.id.clone());
            }
        }
        reset
    }

    /// Reset every subtask to `pending` for a full refresh.
    pub fn reset_all(&mut self) {
        for subtask in self.phases.iter_mut().flat_map(|p| p.subtasks.iter_mut()) {
            subtask.status = SubtaskStatus::Pending;
            subtask.last_error = None;
            subtask.output_refs.clear();
            subtask.escalation = None;
        }
    }

    /// Count subtasks by status.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for subtask in self.phases.iter().flat_map(|p| p.subtasks.iter()) {
            summary.total += 1;
            match subtask.status {
                SubtaskStatus::Pending => summary.pending += 1,
                SubtaskStatus::InProgress => summary.in_progress += 1,
                SubtaskStatus::Completed => summary.completed += 1,
                SubtaskStatus::Failed => summary.failed += 1,
                SubtaskStatus::Escalated => summary.escalated += 1,
            }
        }
        summary
    }
}
