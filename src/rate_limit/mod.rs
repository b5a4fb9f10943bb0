//! Rate-limit detection, backoff and fallback routing.
//!
//! - [`RateLimitClassifier`] decides whether a backend error is throttling
//!   and how long to wait.
//! - [`RateLimitController`] owns the process-wide [`RateLimitState`] and
//!   gates every dispatch through
//!   [`wait_until_dispatchable`](RateLimitController::wait_until_dispatchable).
//!
//! Throttling never counts against a subtask's retry budget.

mod classifier;
mod controller;

pub use classifier::{RateLimitClassification, RateLimitClassifier};
pub use controller::{
    RateLimitConfig, RateLimitController, RateLimitState, RateLimitStatus, RateLimitTransition,
    Route,
};
