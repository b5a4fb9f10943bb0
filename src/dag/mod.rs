//! Dependency graph and scheduling for plan phases.
//!
//! ## Architecture
//!
//! 1. **Builder** - Validates the plan structure (unique ids, known
//!    dependencies, no cycles) and builds a [`PhaseGraph`]
//! 2. **Scheduler** - Picks the next executable phase from plan and
//!    checkpoint state and produces its runnable subtask batch
//!
//! ## Example
//!
//! ```no_run
//! use steadfast::dag::DependencyScheduler;
//! use steadfast::plan::{Phase, Plan};
//!
//! # fn example() -> Result<(), steadfast::errors::PlanIntegrityError> {
//! let plan = Plan::new(vec![
//!     Phase::new("P1", "Setup", vec![], true).with_subtask("s1", "scaffold"),
//!     Phase::new("P2", "Build", vec!["P1".to_string()], false).with_subtask("s2", "compile"),
//! ]);
//!
//! let scheduler = DependencyScheduler::new(&plan)?;
//! let next = scheduler.next_runnable_phase(&plan, None, false);
//! assert_eq!(next.map(|p| p.id.as_str()), Some("P1"));
//! # Ok(())
//! # }
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use scheduler::{BlockedPhase, DependencyScheduler, DispatchMode, SubtaskBatch};
