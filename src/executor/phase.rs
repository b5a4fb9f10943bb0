//! Bounded concurrent dispatch of one phase.
//!
//! All dispatch futures are driven from a single `FuturesUnordered` owned
//! by `run_phase`. Completions are handled one at a time, so plan status,
//! attempt records, rate-limit state and the checkpoint are only ever
//! mutated by this driver.

use super::RunContext;
use super::state::{OrchestratorEvent, PhaseResult};
use crate::backend::{BackendError, DispatchContext, DispatchOutput, ExecutionBackend};
use crate::dag::DependencyScheduler;
use crate::errors::RateLimitExhausted;
use crate::plan::{Subtask, SubtaskStatus};
use crate::rate_limit::{
    RateLimitClassifier, RateLimitController, RateLimitStatus, RateLimitTransition, Route,
};
use crate::recovery::{EscalationReason, EscalationReport};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio::time::Instant;

/// Concurrency and pause limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Process-wide bound on in-flight dispatches (N)
    pub max_parallel: usize,
    /// Longest a dispatch may wait on a paused controller
    pub max_pause: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            max_pause: Duration::from_secs(1800),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn with_max_pause(mut self, max_pause: Duration) -> Self {
        self.max_pause = max_pause;
        self
    }
}

/// A finished dispatch, handed back to the driver.
struct Completion {
    subtask_id: String,
    route: Route,
    attempt: u32,
    result: Result<DispatchOutput, BackendError>,
}

enum Step {
    Completed(Completion),
    GateChanged(Result<Route, RateLimitExhausted>),
}

/// Runs the subtasks of one phase within the concurrency bound.
pub struct PhaseExecutor {
    primary: Arc<dyn ExecutionBackend>,
    fallback: Option<Arc<dyn ExecutionBackend>>,
    controller: RateLimitController,
    classifier: RateLimitClassifier,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    event_tx: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl PhaseExecutor {
    pub fn new(
        primary: Arc<dyn ExecutionBackend>,
        controller: RateLimitController,
        classifier: RateLimitClassifier,
        config: ExecutorConfig,
    ) -> Self {
        let permits = config.max_parallel.max(1);
        Self {
            primary,
            fallback: None,
            controller,
            classifier,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            event_tx: None,
        }
    }

    /// Backend used while the controller routes to the fallback.
    pub fn with_fallback(mut self, fallback: Arc<dyn ExecutionBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Set an event channel for state transitions.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn controller(&self) -> &RateLimitController {
        &self.controller
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Drive a phase until every subtask is terminal or dispatch is aborted
    /// by rate-limit exhaustion.
    ///
    /// Each round re-enqueues failed subtasks that still have budget (and
    /// escalates the rest), then dispatches every pending subtask. A
    /// sequential-only batch runs one subtask at a time in declared order and
    /// retries a failed subtask before moving on to the next; a parallel
    /// batch admits subtasks in declared order up to the global bound.
    pub async fn run_phase(&self, ctx: &mut RunContext, phase_id: &str) -> PhaseResult {
        let started = Instant::now();
        let mut transitions = self.controller.subscribe_transitions();
        let mut checkpointed = false;
        let mut exhausted = None;

        let Some(phase) = ctx.plan.phase(phase_id) else {
            tracing::error!(phase = %phase_id, "Phase not found in plan");
            return PhaseResult::empty(phase_id);
        };
        let batch = DependencyScheduler::runnable_subtasks(phase);
        tracing::info!(
            phase = %phase_id,
            name = %phase.name,
            pending = batch.subtasks.len(),
            mode = ?batch.mode,
            "Phase started"
        );
        self.emit(OrchestratorEvent::PhaseStarted {
            phase: phase_id.to_string(),
            pending: batch.subtasks.len(),
            mode: batch.mode,
        })
        .await;

        loop {
            self.requeue_failed(ctx, phase_id).await;
            self.after_change(ctx, phase_id, &mut checkpointed).await;

            let Some(phase) = ctx.plan.phase(phase_id) else {
                break;
            };
            let batch = DependencyScheduler::runnable_subtasks(phase);
            if batch.is_empty() {
                break;
            }

            let limit = if batch.is_sequential() {
                1
            } else {
                self.config.max_parallel.max(1)
            };
            let result = self
                .dispatch_batch(ctx, phase_id, batch.ids(), limit, &mut transitions, &mut checkpointed)
                .await;
            if let Err(e) = result {
                tracing::warn!(phase = %phase_id, error = %e, "Dispatch aborted");
                exhausted = Some(e);
                break;
            }
        }

        self.drain_transitions(&mut transitions).await;

        let result = match ctx.plan.phase(phase_id) {
            Some(phase) => PhaseResult::from_phase(phase, exhausted.is_some(), started.elapsed()),
            None => PhaseResult::empty(phase_id),
        };
        tracing::info!(
            phase = %phase_id,
            succeeded = result.succeeded.len(),
            escalated = result.escalated.len(),
            pending = result.pending.len(),
            rate_limit_exhausted = result.rate_limit_exhausted,
            "Phase finished"
        );
        self.emit(OrchestratorEvent::PhaseCompleted {
            result: Box::new(result.clone()),
        })
        .await;
        result
    }

    /// Dispatch one round. Returns `Err` when rate limiting aborted the
    /// round; subtasks not yet started stay `pending`, in-flight ones finish.
    async fn dispatch_batch(
        &self,
        ctx: &mut RunContext,
        phase_id: &str,
        ids: Vec<String>,
        limit: usize,
        transitions: &mut broadcast::Receiver<RateLimitTransition>,
        checkpointed: &mut bool,
    ) -> Result<(), RateLimitExhausted> {
        let order: HashMap<String, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let mut queue: VecDeque<String> = ids.into();
        let mut in_flight = FuturesUnordered::new();
        let mut paused_since: Option<Instant> = None;
        let mut exhausted: Option<RateLimitExhausted> = None;

        loop {
            // Admit in declared order while there is capacity and the gate is open
            while exhausted.is_none() && in_flight.len() < limit {
                let Some(id) = queue.front().cloned() else {
                    break;
                };

                if !ctx.recovery.can_retry(&id) {
                    queue.pop_front();
                    let report = ctx.recovery.escalate(&id, EscalationReason::AttemptsExhausted);
                    self.apply_escalation(ctx, phase_id, report).await;
                    self.after_change(ctx, phase_id, checkpointed).await;
                    continue;
                }

                let Some(route) = self.gate() else {
                    break;
                };
                let permit = match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) if in_flight.is_empty() => match self.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    Err(_) => break,
                };

                queue.pop_front();
                paused_since = None;
                if let Some((subtask, dctx, backend, route)) =
                    self.prepare_dispatch(ctx, phase_id, &id, route).await
                {
                    in_flight.push(self.dispatch(backend, subtask, dctx, route, permit));
                }
            }

            if in_flight.is_empty() {
                if queue.is_empty() || exhausted.is_some() {
                    break;
                }
                let remaining = self.remaining_pause(&mut paused_since);
                tracing::debug!(phase = %phase_id, waiting = queue.len(), "Dispatch blocked on rate limit");
                let gate = self.controller.wait_until_dispatchable(remaining).await;
                self.drain_transitions(transitions).await;
                if let Err(e) = gate {
                    exhausted = Some(e);
                }
                continue;
            }

            let step = if exhausted.is_none() && !queue.is_empty() && self.gate().is_none() {
                let remaining = self.remaining_pause(&mut paused_since);
                tokio::select! {
                    Some(done) = in_flight.next() => Step::Completed(done),
                    gate = self.controller.wait_until_dispatchable(remaining) => Step::GateChanged(gate),
                }
            } else {
                match in_flight.next().await {
                    Some(done) => Step::Completed(done),
                    None => continue,
                }
            };

            match step {
                Step::Completed(done) => {
                    let id = done.subtask_id.clone();
                    self.handle_completion(ctx, phase_id, done, &mut queue, &order).await;
                    // Sequential batches resolve each subtask before the next starts
                    if limit == 1 && ctx.plan.subtask(&id).is_some_and(|s| s.status == SubtaskStatus::Failed) {
                        tracing::debug!(subtask = %id, "Retrying sequential subtask in place");
                        ctx.plan.set_status(&id, SubtaskStatus::Pending);
                        queue.push_front(id);
                    }
                    self.after_change(ctx, phase_id, checkpointed).await;
                }
                Step::GateChanged(Err(e)) => exhausted = Some(e),
                Step::GateChanged(Ok(_)) => {}
            }
            self.drain_transitions(transitions).await;
        }

        match exhausted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mark the subtask in progress, pick the backend and build the
    /// dispatch context.
    async fn prepare_dispatch(
        &self,
        ctx: &mut RunContext,
        phase_id: &str,
        subtask_id: &str,
        route: Route,
    ) -> Option<(Subtask, DispatchContext, &dyn ExecutionBackend, Route)> {
        let attempt = ctx.recovery.attempt_count(subtask_id) + 1;
        let phase_name = ctx.plan.phase(phase_id).map(|p| p.name.clone()).unwrap_or_default();
        let subtask = ctx.plan.subtask_mut(subtask_id)?;
        subtask.status = SubtaskStatus::InProgress;
        let subtask = subtask.clone();

        let (backend, route) = match (route, &self.fallback) {
            (Route::Fallback, Some(fallback)) => (fallback.as_ref(), route),
            (Route::Fallback, None) => {
                tracing::warn!("Fallback routing requested but no fallback backend configured");
                (self.primary.as_ref(), Route::Primary)
            }
            (Route::Primary, _) => (self.primary.as_ref(), route),
        };

        let dctx = DispatchContext {
            phase_id: phase_id.to_string(),
            phase_name,
            attempt,
            backend: route.into(),
            previous_error: subtask.last_error.clone(),
        };

        tracing::info!(
            phase = %phase_id,
            subtask = %subtask_id,
            attempt,
            backend = %dctx.backend,
            "Dispatching subtask"
        );
        self.emit(OrchestratorEvent::SubtaskDispatched {
            phase: phase_id.to_string(),
            subtask: subtask_id.to_string(),
            attempt,
            backend: dctx.backend,
        })
        .await;
        if let Err(e) = ctx.save_plan() {
            tracing::warn!(error = %e, "Failed to persist plan");
        }

        Some((subtask, dctx, backend, route))
    }

    async fn dispatch(
        &self,
        backend: &dyn ExecutionBackend,
        subtask: Subtask,
        dctx: DispatchContext,
        route: Route,
        permit: OwnedSemaphorePermit,
    ) -> Completion {
        let _permit = permit;
        let result = backend.execute(&subtask, &dctx).await;
        Completion {
            subtask_id: subtask.id,
            route,
            attempt: dctx.attempt,
            result,
        }
    }

    async fn handle_completion(
        &self,
        ctx: &mut RunContext,
        phase_id: &str,
        done: Completion,
        queue: &mut VecDeque<String>,
        order: &HashMap<String, usize>,
    ) {
        let id = done.subtask_id;
        match done.result {
            Ok(output) => {
                if let Err(e) = ctx.recovery.record_attempt(&id, true, None) {
                    tracing::warn!(subtask = %id, error = %e, "Could not record successful attempt");
                }
                if let Some(subtask) = ctx.plan.subtask_mut(&id) {
                    subtask.status = SubtaskStatus::Completed;
                    subtask.output_refs = output.output_refs;
                    subtask.last_error = None;
                }
                tracing::info!(phase = %phase_id, subtask = %id, attempt = done.attempt, "Subtask completed");
                self.emit(OrchestratorEvent::SubtaskCompleted {
                    phase: phase_id.to_string(),
                    subtask: id,
                    attempt: done.attempt,
                })
                .await;
            }
            Err(err) => {
                let classification = self.classifier.classify(&err);
                if classification.is_rate_limit {
                    // Not an attempt: back to pending, ahead of later siblings
                    ctx.plan.set_status(&id, SubtaskStatus::Pending);
                    let rank = order.get(&id).copied().unwrap_or(usize::MAX);
                    let at = queue.partition_point(|queued| {
                        order.get(queued).copied().unwrap_or(usize::MAX) < rank
                    });
                    queue.insert(at, id.clone());

                    tracing::warn!(
                        phase = %phase_id,
                        subtask = %id,
                        retry_after_secs = classification.retry_after.as_secs_f64(),
                        "Subtask hit a rate limit"
                    );
                    self.controller
                        .on_rate_limited(&classification, done.route.into(), &err.message)
                        .await;
                    self.emit(OrchestratorEvent::SubtaskRateLimited {
                        phase: phase_id.to_string(),
                        subtask: id,
                        retry_after: classification.retry_after,
                    })
                    .await;
                } else {
                    self.record_failure(ctx, phase_id, &id, done.attempt, &err).await;
                }
            }
        }
    }

    async fn record_failure(
        &self,
        ctx: &mut RunContext,
        phase_id: &str,
        id: &str,
        attempt: u32,
        err: &BackendError,
    ) {
        if let Some(subtask) = ctx.plan.subtask_mut(id) {
            subtask.last_error = Some(err.message.clone());
        }

        let outcome = match ctx.recovery.record_attempt(id, false, Some(&err.message)) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(subtask = %id, error = %e, "Attempt finished for an escalated subtask");
                ctx.plan.set_status(id, SubtaskStatus::Escalated);
                return;
            }
        };

        if let Some(report) = outcome.escalation {
            self.apply_escalation(ctx, phase_id, report).await;
            return;
        }

        if ctx.recovery.recovery_context(id).escalation_recommended {
            let report = ctx.recovery.escalate(id, EscalationReason::RecurringFailure);
            self.apply_escalation(ctx, phase_id, report).await;
            return;
        }

        ctx.plan.set_status(id, SubtaskStatus::Failed);
        tracing::warn!(
            phase = %phase_id,
            subtask = %id,
            attempt,
            timed_out = err.timed_out,
            error = %err.message,
            "Subtask attempt failed"
        );
        self.emit(OrchestratorEvent::SubtaskFailed {
            phase: phase_id.to_string(),
            subtask: id.to_string(),
            attempt,
            error: err.message.clone(),
            will_retry: ctx.recovery.can_retry(id),
        })
        .await;
    }

    /// Move failed subtasks back to pending, or escalate those out of budget.
    async fn requeue_failed(&self, ctx: &mut RunContext, phase_id: &str) {
        let failed: Vec<String> = match ctx.plan.phase(phase_id) {
            Some(phase) => phase
                .subtasks
                .iter()
                .filter(|s| s.status == SubtaskStatus::Failed)
                .map(|s| s.id.clone())
                .collect(),
            None => return,
        };

        for id in failed {
            if ctx.recovery.can_retry(&id) {
                tracing::debug!(subtask = %id, "Re-enqueueing failed subtask");
                ctx.plan.set_status(&id, SubtaskStatus::Pending);
            } else {
                let report = ctx.recovery.escalate(&id, EscalationReason::AttemptsExhausted);
                self.apply_escalation(ctx, phase_id, report).await;
            }
        }
    }

    async fn apply_escalation(&self, ctx: &mut RunContext, phase_id: &str, report: EscalationReport) {
        if let Some(subtask) = ctx.plan.subtask_mut(&report.subtask_id) {
            subtask.status = SubtaskStatus::Escalated;
            subtask.escalation = report.artifact.clone();
        }
        self.emit(OrchestratorEvent::SubtaskEscalated {
            phase: phase_id.to_string(),
            subtask: report.subtask_id,
            reason: report.reason,
            artifact: report.artifact,
        })
        .await;
    }

    /// Persist the plan and write the checkpoint once the phase is terminal.
    async fn after_change(&self, ctx: &mut RunContext, phase_id: &str, checkpointed: &mut bool) {
        if let Err(e) = ctx.save_plan() {
            tracing::warn!(error = %e, "Failed to persist plan");
        }

        if *checkpointed {
            return;
        }
        let Some(phase) = ctx.plan.phase(phase_id) else {
            return;
        };
        if phase.subtasks.is_empty() || !phase.is_terminal() {
            return;
        }

        let success = phase.is_resolved();
        let output_refs = phase.output_refs();
        *checkpointed = true;

        match ctx.checkpoint.mark_phase_complete(phase_id, success, output_refs) {
            Ok(()) => {
                tracing::info!(phase = %phase_id, success, "Checkpoint written");
                self.emit(OrchestratorEvent::CheckpointWritten {
                    phase: phase_id.to_string(),
                    success,
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(phase = %phase_id, error = %e, "Checkpoint write failed; will retry at next phase boundary");
            }
        }
    }

    /// Non-blocking view of the controller.
    fn gate(&self) -> Option<Route> {
        match self.controller.status() {
            RateLimitStatus::Ok => Some(Route::Primary),
            RateLimitStatus::UsingFallback => Some(Route::Fallback),
            RateLimitStatus::Throttled | RateLimitStatus::Paused => None,
        }
    }

    fn remaining_pause(&self, paused_since: &mut Option<Instant>) -> Duration {
        let since = *paused_since.get_or_insert_with(Instant::now);
        self.config.max_pause.saturating_sub(since.elapsed())
    }

    async fn drain_transitions(&self, transitions: &mut broadcast::Receiver<RateLimitTransition>) {
        loop {
            match transitions.try_recv() {
                Ok(t) => {
                    self.emit(OrchestratorEvent::RateLimitChanged { from: t.from, to: t.to })
                        .await
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Missed rate-limit transitions");
                }
                Err(_) => break,
            }
        }
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
