//! Resilient multi-phase task orchestration.
//!
//! A [`plan::Plan`] is an ordered list of phases with dependencies; each
//! phase holds subtasks that an [`backend::ExecutionBackend`] carries out.
//! The [`executor::Orchestrator`] runs phases in dependency order, fans
//! subtasks out within a global concurrency bound, retries failures up to a
//! budget, backs off on rate limiting and checkpoints completed phases so an
//! interrupted run resumes where it stopped.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod plan;
pub mod rate_limit;
pub mod recovery;
pub mod util;
