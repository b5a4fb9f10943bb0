//! Plan model and persistence.
//!
//! A [`Plan`] is an ordered list of [`Phase`]s, each owning an ordered list of
//! [`Subtask`]s. The plan document is JSON:
//!
//! ```json
//! {
//!   "phases": [
//!     {
//!       "id": "P1", "name": "Setup", "depends_on": [], "parallel_safe": true,
//!       "subtasks": [{"id": "s1", "status": "pending", "description": "..."}]
//!     }
//!   ]
//! }
//! ```

mod model;
mod store;

pub use model::{Phase, Plan, PlanSummary, Subtask, SubtaskStatus};
pub use store::PlanStore;
