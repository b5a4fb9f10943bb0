//! `steadfast run`: build the backends and drive the plan.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use steadfast::backend::{BackendKind, CommandBackend, CommandProbe, ExecutionBackend, StaticProbe};
use steadfast::config::Config;
use steadfast::executor::{Orchestrator, OrchestratorEvent, PhaseExecutor, RunContext, RunOutcome};
use steadfast::plan::Plan;
use steadfast::rate_limit::RateLimitController;
use tokio::sync::mpsc;

use super::super::Cli;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    fresh: bool,
    max_parallel: Option<usize>,
    max_attempts: Option<u32>,
    json: bool,
) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?.with_cli_overrides(max_parallel, max_attempts);

    let plan_store = config.plan_store();
    if !plan_store.exists() {
        anyhow::bail!(
            "No plan found at {}. Write a plan document there first.",
            plan_store.path().display()
        );
    }
    let plan = plan_store.load()?;

    let _lock = super::acquire_run_lock(&config)?;

    let (tx, mut rx) = mpsc::channel::<OrchestratorEvent>(256);
    let executor = build_executor(&config)?.with_event_channel(tx.clone());
    let ctx = RunContext::new(plan, config.recovery_manager()?, config.checkpoint_store())
        .with_plan_store(plan_store);

    let display = RunDisplay::new(&ctx.plan, fresh, json);
    if !json {
        println!();
        println!("{}", console::style("Steadfast").bold().cyan());
        println!("─────────────────────────");
        println!("Phases:       {}", ctx.plan.phases.len());
        println!("Max parallel: {}", config.toml.executor.max_parallel);
        println!("Max attempts: {}", config.toml.recovery.max_attempts);
        if config.toml.backend.fallback_command.is_some() {
            println!("Fallback:     enabled");
        }
        if fresh {
            println!("Mode:         fresh");
        }
        println!();
    }

    let display_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            display.handle(&event);
        }
        display.finish();
    });

    let mut orchestrator = Orchestrator::new(executor, ctx).with_event_channel(tx);

    let outcome = tokio::select! {
        outcome = orchestrator.run(fresh) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            drop(orchestrator);
            display_handle.await.ok();
            anyhow::bail!("Interrupted. In-flight subtasks will be dispatched again on the next run.");
        }
    };

    // Dropping the orchestrator closes the event channel
    let ctx = orchestrator.into_context();
    display_handle.await.context("Event display task failed")?;

    report_outcome(&outcome, &ctx, json)
}

/// Primary and optional fallback backends behind one rate-limit controller.
fn build_executor(config: &Config) -> Result<PhaseExecutor> {
    let command = config.backend_command().context(
        "No backend command configured. Set [backend].command in .steadfast/steadfast.toml or STEADFAST_BACKEND_CMD",
    )?;
    let timeout = config.backend_timeout();
    let backend = &config.toml.backend;

    let mut controller = RateLimitController::new(config.rate_limit_config());
    if let Some(health) = &backend.health_command {
        controller = controller.with_primary_probe(Arc::new(CommandProbe::new(
            health.clone(),
            &config.project_dir,
            timeout,
        )));
    }

    let fallback: Option<Arc<dyn ExecutionBackend>> = match &backend.fallback_command {
        Some(fallback_command) => {
            controller = match &backend.fallback_health_command {
                Some(health) => controller.with_fallback_probe(Arc::new(CommandProbe::new(
                    health.clone(),
                    &config.project_dir,
                    timeout,
                ))),
                None => controller.with_fallback_probe(Arc::new(StaticProbe(true))),
            };
            Some(Arc::new(CommandBackend::new(
                fallback_command.clone(),
                &config.project_dir,
                timeout,
                BackendKind::Fallback,
            )))
        }
        None => None,
    };

    let primary = Arc::new(CommandBackend::new(
        command,
        &config.project_dir,
        timeout,
        BackendKind::Primary,
    ));
    let mut executor = PhaseExecutor::new(primary, controller, config.classifier(), config.executor_config());
    if let Some(fallback) = fallback {
        executor = executor.with_fallback(fallback);
    }
    Ok(executor)
}

fn report_outcome(outcome: &RunOutcome, ctx: &RunContext, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(outcome).context("Failed to serialize run outcome")?
        );
    }

    match outcome {
        RunOutcome::Completed => {
            if !json {
                println!();
                println!("{}", console::style("All phases completed.").green().bold());
            }
            Ok(())
        }
        RunOutcome::Paused {
            phase,
            pending,
            manual_resume_required,
        } => {
            if !json {
                println!();
                println!(
                    "{} phase {} with {} subtask(s) still pending: {}",
                    console::style("Paused:").yellow().bold(),
                    phase,
                    pending.len(),
                    pending.join(", ")
                );
                if *manual_resume_required {
                    println!("The primary backend did not recover. Check it, then run 'steadfast run' to resume.");
                } else {
                    println!("Rate limiting outlasted the pause window. Run 'steadfast run' to resume.");
                }
            }
            anyhow::bail!("Run paused by rate limiting")
        }
        RunOutcome::Stopped { escalated, blocked } => {
            if !json {
                println!();
                if !escalated.is_empty() {
                    println!(
                        "{} {} subtask(s) need attention:",
                        console::style("Escalated:").red().bold(),
                        escalated.len()
                    );
                    for id in escalated {
                        match ctx.plan.subtask(id).and_then(|s| s.escalation.as_ref()) {
                            Some(path) => println!("  {} → {}", id, path.display()),
                            None => println!("  {}", id),
                        }
                    }
                }
                for b in blocked {
                    println!(
                        "  {} {} waits on {}",
                        console::style("Blocked:").dim(),
                        b.phase,
                        b.waiting_on.join(", ")
                    );
                }
            }
            anyhow::bail!("Run stopped with {} escalated subtask(s)", escalated.len())
        }
    }
}

/// Renders orchestrator events as progress lines or JSON.
struct RunDisplay {
    json: bool,
    bar: ProgressBar,
}

impl RunDisplay {
    fn new(plan: &Plan, fresh: bool, json: bool) -> Self {
        let summary = plan.summary();
        let bar = if json || !std::io::stdout().is_terminal() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(summary.total as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        };
        if !fresh {
            bar.set_position(summary.completed as u64);
        }
        Self { json, bar }
    }

    fn line(&self, message: String) {
        if self.bar.is_hidden() {
            println!("{}", message);
        } else {
            self.bar.println(message);
        }
    }

    fn handle(&self, event: &OrchestratorEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Warning: Could not serialize event: {}", e),
            }
            return;
        }

        match event {
            OrchestratorEvent::RunStarted { .. } | OrchestratorEvent::RunFinished { .. } => {}
            OrchestratorEvent::PhaseStarted {
                phase,
                pending,
                mode,
            } => {
                self.line(format!(
                    "{} Phase {} ({} pending, {:?})",
                    console::style("▶").cyan(),
                    console::style(phase).yellow(),
                    pending,
                    mode
                ));
            }
            OrchestratorEvent::SubtaskDispatched {
                subtask,
                attempt,
                backend,
                ..
            } => {
                self.bar
                    .set_message(format!("{} (attempt {}, {})", subtask, attempt, backend));
            }
            OrchestratorEvent::SubtaskCompleted { subtask, .. } => {
                self.bar.inc(1);
                self.line(format!("  {} {}", console::style("✓").green(), subtask));
            }
            OrchestratorEvent::SubtaskFailed {
                subtask,
                attempt,
                error,
                will_retry,
                ..
            } => {
                let next = if *will_retry { "will retry" } else { "no retries left" };
                self.line(format!(
                    "  {} {} attempt {}: {} ({})",
                    console::style("✗").red(),
                    subtask,
                    attempt,
                    error,
                    next
                ));
            }
            OrchestratorEvent::SubtaskRateLimited {
                subtask, retry_after, ..
            } => {
                self.line(format!(
                    "  {} {} rate limited, retry after {}s",
                    console::style("⏸").yellow(),
                    subtask,
                    retry_after.as_secs()
                ));
            }
            OrchestratorEvent::SubtaskEscalated {
                subtask,
                reason,
                artifact,
                ..
            } => {
                let target = artifact
                    .as_ref()
                    .map(|p| format!(" → {}", p.display()))
                    .unwrap_or_default();
                self.line(format!(
                    "  {} {} escalated: {}{}",
                    console::style("⚠").red().bold(),
                    subtask,
                    reason,
                    target
                ));
            }
            OrchestratorEvent::RateLimitChanged { from, to } => {
                self.line(format!(
                    "  {} {} → {}",
                    console::style("Rate limit:").yellow(),
                    from,
                    to
                ));
            }
            OrchestratorEvent::CheckpointWritten { phase, success } => {
                let state = if *success { "complete" } else { "unresolved" };
                self.line(format!(
                    "  {}",
                    console::style(format!("checkpoint: {} {}", phase, state)).dim()
                ));
            }
            OrchestratorEvent::PhaseCompleted { result } => {
                self.line(format!(
                    "{} Phase {}: {} succeeded, {} escalated, {} pending ({:.1}s)",
                    console::style("■").cyan(),
                    result.phase,
                    result.succeeded.len(),
                    result.escalated.len(),
                    result.pending.len(),
                    result.duration.as_secs_f64()
                ));
            }
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
