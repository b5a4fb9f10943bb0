use super::*;
use crate::backend::mock::{MockBackend, MockProbe, MockResponse};
use crate::backend::ExecutionBackend;
use crate::checkpoint::CheckpointStore;
use crate::dag::DependencyScheduler;
use crate::errors::{OrchestratorError, PlanIntegrityError};
use crate::plan::{Phase, Plan, PlanStore, SubtaskStatus};
use crate::rate_limit::{RateLimitClassifier, RateLimitConfig, RateLimitController, RateLimitStatus};
use crate::recovery::{EscalationReason, RecoveryManager};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;

fn two_phase_plan() -> Plan {
    Plan::new(vec![
        Phase::new("P1", "Scaffold", vec![], true)
            .with_subtask("s1", "create module")
            .with_subtask("s2", "add types")
            .with_subtask("s3", "add tests"),
        Phase::new("P2", "Wire up", vec!["P1".to_string()], false).with_subtask("s4", "wire it"),
    ])
}

fn sequential_plan(count: usize) -> Plan {
    let mut phase = Phase::new("P1", "Migrate", vec![], false);
    for i in 1..=count {
        phase = phase.with_subtask(&format!("s{i}"), "step");
    }
    Plan::new(vec![phase])
}

fn context(plan: Plan, dir: &TempDir, max_attempts: u32) -> RunContext {
    RunContext::new(
        plan,
        RecoveryManager::new(max_attempts).with_escalation_dir(dir.path().join("escalations")),
        CheckpointStore::new(dir.path().join("checkpoint.json"), "fp-test"),
    )
}

fn controller(max_retries: u32, primary_available: bool) -> RateLimitController {
    RateLimitController::new(RateLimitConfig {
        max_wait: Duration::from_secs(60),
        backoff_multiplier: 2.0,
        max_retries,
    })
    .with_primary_probe(Arc::new(MockProbe::always(primary_available)))
}

fn executor(backend: Arc<MockBackend>, controller: RateLimitController, max_parallel: usize) -> PhaseExecutor {
    PhaseExecutor::new(
        backend,
        controller,
        RateLimitClassifier::new(Duration::from_secs(10), Duration::from_secs(60)),
        ExecutorConfig::default().with_max_parallel(max_parallel),
    )
}

fn drain(rx: &mut mpsc::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_parallel_phase_respects_bound_and_dependencies() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").with_delay(Duration::from_millis(50)));
    let store = PlanStore::new(dir.path().join("plan.json"));
    let ctx = context(two_phase_plan(), &dir, 3).with_plan_store(store.clone());

    let mut orchestrator = Orchestrator::new(executor(backend.clone(), controller(3, true), 2), ctx);
    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.max_in_flight(), 2);
    assert_eq!(backend.call_order(), vec!["s1", "s2", "s3", "s4"]);
    // P2 starts only after every P1 subtask has finished
    let s4_start = backend.timeline_index("start s4").unwrap();
    for id in ["s1", "s2", "s3"] {
        assert!(backend.timeline_index(&format!("end {id}")).unwrap() < s4_start);
    }

    let saved = store.load().unwrap();
    assert_eq!(saved.summary().completed, 4);
    assert_eq!(
        saved.subtask("s2").unwrap().output_refs,
        vec!["out/s2.txt".to_string()]
    );
    // Finished runs leave no checkpoint behind
    assert!(!dir.path().join("checkpoint.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_failure_budget_exhaustion_escalates() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").script(
        "s1",
        vec![
            MockResponse::Fail("compile error in parser.rs".to_string()),
            MockResponse::Fail("connection reset while fetching crates".to_string()),
        ],
    ));
    let (tx, mut rx) = mpsc::channel(256);
    let exec = executor(backend.clone(), controller(3, true), 2).with_event_channel(tx.clone());
    let mut orchestrator = Orchestrator::new(exec, context(two_phase_plan(), &dir, 2)).with_event_channel(tx);

    let outcome = orchestrator.run(false).await.unwrap();

    let RunOutcome::Stopped { escalated, blocked } = outcome else {
        panic!("expected a stopped run, got {outcome:?}");
    };
    assert_eq!(escalated, vec!["s1"]);
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].phase, "P2");
    assert_eq!(blocked[0].waiting_on, vec!["P1"]);

    let ctx = orchestrator.context();
    assert_eq!(ctx.recovery.attempt_count("s1"), 2);
    assert!(!ctx.recovery.can_retry("s1"));
    assert_eq!(ctx.plan.subtask("s1").unwrap().status, SubtaskStatus::Escalated);
    assert!(ctx.plan.subtask("s1").unwrap().escalation.as_ref().unwrap().exists());
    assert_eq!(backend.calls_for("s1"), 2);
    assert_eq!(backend.calls_for("s4"), 0);

    // A failed phase still gets a checkpoint entry
    let entry = ctx.checkpoint.checkpoint().entry("P1").unwrap();
    assert!(!entry.success);

    let events = drain(&mut rx);
    let failures: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::SubtaskFailed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![true]);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::SubtaskEscalated {
            reason: EscalationReason::AttemptsExhausted,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_recurring_failure_escalates_early() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").script(
        "s1",
        vec![
            MockResponse::Fail("error: missing semicolon at line 12".to_string()),
            MockResponse::Fail("error: missing semicolon at line 40".to_string()),
        ],
    ));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 2),
        context(sequential_plan(1), &dir, 5),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Stopped { .. }));
    let ctx = orchestrator.context();
    assert_eq!(ctx.recovery.attempt_count("s1"), 2);
    assert!(ctx.recovery.is_escalated("s1"));
    assert_eq!(backend.calls_for("s1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(
        MockBackend::new("primary").script("s2", vec![MockResponse::Fail("flaky network".to_string())]),
    );
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 3),
        context(two_phase_plan(), &dir, 3),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    let ctx = orchestrator.context();
    assert_eq!(ctx.recovery.attempt_count("s2"), 2);
    assert!(ctx.plan.subtask("s2").unwrap().last_error.is_none());
    assert_eq!(backend.calls_for("s2"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_phase_retries_in_place() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(
        MockBackend::new("primary").script("s1", vec![MockResponse::Fail("lock held".to_string())]),
    );
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 3),
        context(sequential_plan(3), &dir, 3),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.call_order(), vec!["s1", "s1", "s2", "s3"]);
    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(
        backend.timeline(),
        vec!["start s1", "end s1", "start s1", "end s1", "start s2", "end s2", "start s3", "end s3"]
    );
    assert_eq!(orchestrator.context().recovery.attempt_count("s1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_phase_escalation_precedes_later_siblings() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").script(
        "s2",
        vec![
            MockResponse::Fail("disk full".to_string()),
            MockResponse::Fail("permission denied on /var/cache".to_string()),
        ],
    ));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 3),
        context(sequential_plan(3), &dir, 2),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    let RunOutcome::Stopped { escalated, .. } = outcome else {
        panic!("expected a stopped run, got {outcome:?}");
    };
    assert_eq!(escalated, vec!["s2"]);
    assert_eq!(backend.call_order(), vec!["s1", "s2", "s2", "s3"]);
    assert_eq!(backend.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_does_not_spend_attempts() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").script("s1", vec![MockResponse::RateLimited]));
    let (tx, mut rx) = mpsc::channel(256);
    let exec = executor(backend.clone(), controller(3, true), 2).with_event_channel(tx);
    let mut orchestrator = Orchestrator::new(exec, context(sequential_plan(1), &dir, 2));

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    let ctx = orchestrator.context();
    let attempts = ctx.recovery.attempts("s1");
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert_eq!(backend.calls_for("s1"), 2);

    let transitions: Vec<(RateLimitStatus, RateLimitStatus)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::RateLimitChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RateLimitStatus::Ok, RateLimitStatus::Throttled),
            (RateLimitStatus::Throttled, RateLimitStatus::Paused),
            (RateLimitStatus::Paused, RateLimitStatus::Ok),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_routes_to_fallback() {
    let dir = tempdir().unwrap();
    let primary = Arc::new(MockBackend::new("primary").script("s1", vec![MockResponse::RateLimited]));
    let fallback = Arc::new(MockBackend::new("fallback"));
    let controller = controller(3, false).with_fallback_probe(Arc::new(MockProbe::always(true)));
    let exec = executor(primary.clone(), controller, 2)
        .with_fallback(fallback.clone() as Arc<dyn ExecutionBackend>);
    let mut orchestrator = Orchestrator::new(exec, context(sequential_plan(2), &dir, 2));

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(primary.call_order(), vec!["s1"]);
    assert_eq!(fallback.call_order(), vec!["s1", "s2"]);
    assert_eq!(
        orchestrator.executor().controller().status(),
        RateLimitStatus::UsingFallback
    );
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_checkpointed_phase() {
    let dir = tempdir().unwrap();
    let mut previous = CheckpointStore::new(dir.path().join("checkpoint.json"), "fp-test");
    previous
        .mark_phase_complete("P1", true, vec!["out/s1.txt".to_string()])
        .unwrap();

    let plan = two_phase_plan();
    let mut reloaded = CheckpointStore::new(dir.path().join("checkpoint.json"), "fp-test");
    let scheduler = DependencyScheduler::new(&plan).unwrap();
    let next = scheduler.next_runnable_phase(&plan, Some(reloaded.load()), false);
    assert_eq!(next.map(|p| p.id.as_str()), Some("P2"));

    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 2),
        context(plan, &dir, 2),
    );
    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.call_order(), vec!["s4"]);
}

#[tokio::test(start_paused = true)]
async fn test_changed_configuration_reruns_completed_work() {
    let dir = tempdir().unwrap();
    let mut previous = CheckpointStore::new(dir.path().join("checkpoint.json"), "old");
    previous.mark_phase_complete("P1", true, vec![]).unwrap();

    let mut plan = two_phase_plan();
    for id in ["s1", "s2", "s3"] {
        plan.set_status(id, SubtaskStatus::Completed);
    }

    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 3),
        context(plan, &dir, 2),
    );
    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.call_order(), vec!["s1", "s2", "s3", "s4"]);
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_reruns_everything() {
    let dir = tempdir().unwrap();
    let mut previous = CheckpointStore::new(dir.path().join("checkpoint.json"), "fp-test");
    previous.mark_phase_complete("P1", true, vec![]).unwrap();

    let mut plan = two_phase_plan();
    plan.set_status("s1", SubtaskStatus::Completed);
    plan.set_status("s2", SubtaskStatus::Escalated);

    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 2),
        context(plan, &dir, 2),
    );
    let outcome = orchestrator.run(true).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_subtasks_are_redispatched() {
    let dir = tempdir().unwrap();
    let mut plan = sequential_plan(2);
    plan.set_status("s1", SubtaskStatus::Completed);
    plan.set_status("s2", SubtaskStatus::InProgress);

    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 2),
        context(plan, &dir, 2),
    );
    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.call_order(), vec!["s2"]);
    assert_eq!(orchestrator.context().recovery.attempt_count("s2"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_rate_limit_pauses_run() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("primary").script("s4", vec![MockResponse::RateLimited]));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(1, false), 3),
        context(sequential_plan(5), &dir, 2),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Paused {
            phase: "P1".to_string(),
            pending: vec!["s4".to_string(), "s5".to_string()],
            manual_resume_required: true,
        }
    );
    let ctx = orchestrator.context();
    for id in ["s1", "s2", "s3"] {
        assert_eq!(ctx.plan.subtask(id).unwrap().status, SubtaskStatus::Completed);
    }
    for id in ["s4", "s5"] {
        assert_eq!(ctx.plan.subtask(id).unwrap().status, SubtaskStatus::Pending);
        assert_eq!(ctx.recovery.attempt_count(id), 0);
    }
    assert_eq!(backend.call_order(), vec!["s1", "s2", "s3", "s4"]);
    // No checkpoint for an unfinished phase
    assert!(ctx.checkpoint.checkpoint().entry("P1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_siblings_finish_while_paused() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(
        MockBackend::new("primary")
            .with_delay(Duration::from_millis(20))
            .script("s1", vec![MockResponse::RateLimited]),
    );
    let plan = Plan::new(vec![
        Phase::new("P1", "Fan out", vec![], true)
            .with_subtask("s1", "a")
            .with_subtask("s2", "b")
            .with_subtask("s3", "c"),
    ]);
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 3),
        context(plan, &dir, 2),
    );

    let outcome = orchestrator.run(false).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(backend.calls_for("s1"), 2);
    assert_eq!(backend.calls_for("s2"), 1);
    assert_eq!(backend.calls_for("s3"), 1);
    assert_eq!(backend.call_order().last().map(String::as_str), Some("s1"));
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected_before_dispatch() {
    let dir = tempdir().unwrap();
    let plan = Plan::new(vec![
        Phase::new("A", "a", vec!["B".to_string()], false).with_subtask("a1", ""),
        Phase::new("B", "b", vec!["A".to_string()], false).with_subtask("b1", ""),
    ]);
    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(
        executor(backend.clone(), controller(3, true), 2),
        context(plan, &dir, 2),
    );

    let err = orchestrator.run(false).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::PlanIntegrity(PlanIntegrityError::Cycle { .. })
    ));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_plan_persist_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let ctx = context(sequential_plan(1), &dir, 2).with_plan_store(PlanStore::new(blocker.join("plan.json")));

    let backend = Arc::new(MockBackend::new("primary"));
    let mut orchestrator = Orchestrator::new(executor(backend.clone(), controller(3, true), 2), ctx);

    let err = orchestrator.run(false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PlanPersist { .. }));
    assert_eq!(backend.call_count(), 0);
}
