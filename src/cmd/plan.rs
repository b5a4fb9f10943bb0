//! Plan inspection and reset: `status`, `validate`, `reset`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use steadfast::config::Config;
use steadfast::dag::{DagBuilder, DependencyScheduler};
use steadfast::plan::{Phase, SubtaskStatus};

use super::super::Cli;

pub fn cmd_status(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?;
    let plan_store = config.plan_store();

    println!();
    println!("{}", console::style("Steadfast Status").bold().cyan());
    println!("─────────────────────────");

    if !plan_store.exists() {
        println!("No plan found at {}", plan_store.path().display());
        println!();
        return Ok(());
    }

    let plan = plan_store.load()?;
    let summary = plan.summary();
    println!(
        "Plan:       {} ({} phases, {} subtasks)",
        plan_store.path().display(),
        plan.phases.len(),
        summary.total
    );
    println!(
        "Progress:   {} completed, {} in progress, {} pending, {} failed, {} escalated",
        summary.completed, summary.in_progress, summary.pending, summary.failed, summary.escalated
    );

    // A stale checkpoint is reported but never used
    let store = config.checkpoint_store();
    let checkpoint = match store.read() {
        Ok(Some(checkpoint)) if checkpoint.matches(store.fingerprint()) => {
            println!(
                "Checkpoint: {} phase(s) recorded, last updated {}",
                checkpoint.completed_phases.len(),
                checkpoint.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
            );
            Some(checkpoint)
        }
        Ok(Some(checkpoint)) => {
            println!(
                "Checkpoint: {} (written for {}, current settings are {})",
                console::style("stale").yellow(),
                checkpoint.model_fingerprint,
                store.fingerprint()
            );
            None
        }
        Ok(None) => {
            println!("Checkpoint: none");
            None
        }
        Err(e) => {
            println!("Checkpoint: {} ({})", console::style("unreadable").red(), e);
            None
        }
    };

    let scheduler = DependencyScheduler::new(&plan)?;
    let blocked = scheduler.blocked_phases(&plan, checkpoint.as_ref(), false);

    println!();
    println!("{:<12} {:<28} {:<12} Notes", "Phase", "Name", "Done");
    println!("{:<12} {:<28} {:<12} -----", "-----", "----", "----");
    for phase in &plan.phases {
        let mut notes = Vec::new();
        if checkpoint
            .as_ref()
            .is_some_and(|c| c.is_phase_complete(&phase.id))
        {
            notes.push(console::style("checkpointed").green().to_string());
        }
        if let Some(b) = blocked.iter().find(|b| b.phase == phase.id) {
            notes.push(format!("waiting on {}", b.waiting_on.join(", ")));
        }
        let escalated = phase.count(SubtaskStatus::Escalated);
        if escalated > 0 {
            notes.push(console::style(format!("{} escalated", escalated)).red().to_string());
        }
        println!(
            "{:<12} {:<28} {:<12} {}",
            phase.id,
            truncate(&phase.name, 28),
            progress(phase),
            notes.join(", ")
        );
    }

    let recovery = config.recovery_manager()?;
    let escalated = recovery.escalated();
    if !escalated.is_empty() {
        println!();
        println!("{}", console::style("Escalations").bold().red());
        for id in &escalated {
            let artifact = plan
                .subtask(id)
                .and_then(|s| s.escalation.clone())
                .unwrap_or_else(|| config.escalations_dir().join(format!("{}.md", id)));
            println!(
                "  {} ({} attempt(s)) → {}",
                id,
                recovery.attempt_count(id),
                artifact.display()
            );
        }
    }
    println!();

    Ok(())
}

pub fn cmd_validate(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?;
    let plan_store = config.plan_store();
    if !plan_store.exists() {
        anyhow::bail!("No plan found at {}", plan_store.path().display());
    }

    let plan = plan_store.load()?;
    let graph = DagBuilder::new(&plan.phases).build()?;

    println!(
        "{} {} phases, {} subtasks",
        console::style("Plan is valid:").green().bold(),
        plan.phases.len(),
        plan.summary().total
    );
    for (i, wave) in graph.compute_waves().iter().enumerate() {
        println!("  Wave {}: {}", i + 1, wave.join(", "));
    }

    for warning in config.toml.validate() {
        println!("{} {}", console::style("Config warning:").yellow(), warning);
    }

    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: PathBuf, force: bool, keep_recovery: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = Config::new(project_dir, cli.verbose)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will reset all progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let _lock = super::acquire_run_lock(&config)?;

    let plan_store = config.plan_store();
    if plan_store.exists() {
        let mut plan = plan_store.load()?;
        plan.reset_all();
        plan_store.save(&plan)?;
    }

    config
        .checkpoint_store()
        .clear()
        .context("Failed to remove checkpoint")?;

    if !keep_recovery {
        config
            .recovery_manager()?
            .clear_all()
            .context("Failed to clear attempt history")?;
        let escalations = config.escalations_dir();
        if escalations.exists() {
            std::fs::remove_dir_all(&escalations).with_context(|| {
                format!("Failed to remove {}", escalations.display())
            })?;
        }
    }

    println!("Reset complete");
    Ok(())
}

fn progress(phase: &Phase) -> String {
    format!(
        "{}/{}",
        phase.count(SubtaskStatus::Completed),
        phase.subtasks.len()
    )
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
