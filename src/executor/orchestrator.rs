//! Run driver: phase selection, resume and run outcome.

use super::RunContext;
use super::phase::PhaseExecutor;
use super::state::{OrchestratorEvent, RunOutcome};
use crate::dag::DependencyScheduler;
use crate::errors::{OrchestratorError, RateLimitExhausted};
use crate::plan::Phase;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Drives a plan to completion, one phase at a time.
pub struct Orchestrator {
    executor: PhaseExecutor,
    ctx: RunContext,
    event_tx: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(executor: PhaseExecutor, ctx: RunContext) -> Self {
        Self {
            executor,
            ctx,
            event_tx: None,
        }
    }

    /// Set an event channel for run-level events. Pass the same sender to
    /// [`PhaseExecutor::with_event_channel`] to observe everything in one
    /// stream.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn executor(&self) -> &PhaseExecutor {
        &self.executor
    }

    pub fn into_context(self) -> RunContext {
        self.ctx
    }

    /// Run every runnable phase in dependency order.
    ///
    /// With `force_refresh` every subtask is reset, the checkpoint and the
    /// attempt history are cleared, and no phase is skipped. Otherwise
    /// phases the checkpoint marks successful are skipped and subtasks left
    /// `in_progress` by an interrupted run go back to `pending`.
    ///
    /// Only an invalid plan or a failure to persist the plan before the
    /// first dispatch is an error; everything else ends in a [`RunOutcome`].
    pub async fn run(&mut self, force_refresh: bool) -> Result<RunOutcome, OrchestratorError> {
        let scheduler = DependencyScheduler::new(&self.ctx.plan)?;
        let run_id = Uuid::new_v4().to_string();

        if force_refresh {
            tracing::info!("Fresh run requested, discarding previous progress");
            self.ctx.plan.reset_all();
            if let Err(e) = self.ctx.checkpoint.clear() {
                tracing::warn!(error = %e, "Could not remove old checkpoint");
            }
            if let Err(e) = self.ctx.recovery.clear_all() {
                tracing::warn!(error = %e, "Could not clear attempt history");
            }
        } else {
            let checkpoint = self.ctx.checkpoint.load();
            if !checkpoint.is_empty() {
                tracing::info!(
                    phases = checkpoint.completed_phases.len(),
                    "Resuming from checkpoint"
                );
            }
            self.invalidate_stale_results();
        }

        let reverted = self.ctx.plan.recover_interrupted();
        if !reverted.is_empty() {
            tracing::info!(subtasks = ?reverted, "Reverted interrupted subtasks to pending");
        }

        if let Some(store) = &self.ctx.plan_store {
            store
                .save(&self.ctx.plan)
                .map_err(|source| OrchestratorError::PlanPersist {
                    path: store.path().to_path_buf(),
                    source,
                })?;
        }

        tracing::info!(
            run_id = %run_id,
            phases = self.ctx.plan.phases.len(),
            force_refresh,
            "Run started"
        );
        self.emit(OrchestratorEvent::RunStarted {
            run_id: run_id.clone(),
            phases: self.ctx.plan.phases.len(),
            force_refresh,
        })
        .await;

        let outcome = self.drive(&scheduler, force_refresh).await;

        match &outcome {
            RunOutcome::Completed => tracing::info!(run_id = %run_id, "Run completed"),
            RunOutcome::Paused {
                phase,
                manual_resume_required,
                ..
            } => tracing::warn!(
                run_id = %run_id,
                phase = %phase,
                manual_resume_required,
                "Run paused by rate limiting"
            ),
            RunOutcome::Stopped { escalated, blocked } => tracing::warn!(
                run_id = %run_id,
                escalated = escalated.len(),
                blocked = blocked.len(),
                "Run stopped with unresolved phases"
            ),
        }
        self.emit(OrchestratorEvent::RunFinished {
            run_id,
            outcome: outcome.clone(),
        })
        .await;

        Ok(outcome)
    }

    async fn drive(&mut self, scheduler: &DependencyScheduler, force_refresh: bool) -> RunOutcome {
        loop {
            if let Err(e) = self.ctx.checkpoint.flush() {
                tracing::warn!(error = %e, "Checkpoint still not persisted");
            }

            let next = scheduler
                .next_runnable_phase(
                    &self.ctx.plan,
                    Some(self.ctx.checkpoint.checkpoint()),
                    force_refresh,
                )
                .map(|phase| phase.id.clone());
            let Some(phase_id) = next else {
                break;
            };

            let result = self.executor.run_phase(&mut self.ctx, &phase_id).await;

            if result.rate_limit_exhausted {
                let manual_resume_required = self.executor.controller().state().manual_resume_required;
                return RunOutcome::Paused {
                    phase: phase_id,
                    pending: result.pending,
                    manual_resume_required,
                };
            }

            // A phase that neither finished nor paused would be selected forever
            if !self.ctx.plan.phase(&phase_id).is_some_and(Phase::is_terminal) {
                tracing::error!(phase = %phase_id, "Phase left unfinished without a rate-limit pause");
                break;
            }
        }

        self.finish(scheduler, force_refresh)
    }

    fn finish(&mut self, scheduler: &DependencyScheduler, force_refresh: bool) -> RunOutcome {
        let checkpoint = self.ctx.checkpoint.checkpoint();
        let all_done = self
            .ctx
            .plan
            .phases
            .iter()
            .all(|p| p.is_resolved() || (!force_refresh && checkpoint.is_phase_complete(&p.id)));

        if all_done {
            if let Err(e) = self.ctx.checkpoint.clear() {
                tracing::warn!(error = %e, "Run completed but checkpoint could not be removed");
            }
            return RunOutcome::Completed;
        }

        RunOutcome::Stopped {
            escalated: self.ctx.plan.escalated_subtasks(),
            blocked: scheduler.blocked_phases(&self.ctx.plan, Some(checkpoint), force_refresh),
        }
    }

    /// Results recorded under another configuration are not reused: when
    /// `load` discarded a stale checkpoint, every completed or failed
    /// subtask goes back to `pending`.
    fn invalidate_stale_results(&mut self) {
        let Some(stale) = self.ctx.checkpoint.discarded() else {
            return;
        };
        let stale_fingerprint = stale.model_fingerprint.clone();

        let phase_ids: Vec<String> = self.ctx.plan.phases.iter().map(|p| p.id.clone()).collect();
        let mut reset = Vec::new();
        for phase_id in &phase_ids {
            reset.extend(self.ctx.plan.reset_phase(phase_id));
        }
        if !reset.is_empty() {
            tracing::warn!(
                stale = %stale_fingerprint,
                current = %self.ctx.checkpoint.fingerprint(),
                subtasks = ?reset,
                "Configuration changed since the last run, re-running completed subtasks"
            );
        }
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
