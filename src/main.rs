use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "steadfast")]
#[command(version, about = "Resilient multi-phase task orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the plan, resuming from the last checkpoint
    Run {
        /// Discard checkpoint, attempt history and statuses, then run everything
        #[arg(long)]
        fresh: bool,

        /// Maximum concurrent subtask dispatches
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Attempts per subtask before escalation
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Print events as JSON lines instead of the progress display
        #[arg(long)]
        json: bool,
    },
    /// Show plan progress, checkpoint and escalations
    Status,
    /// Check the plan for cycles, unknown dependencies and duplicate ids
    Validate,
    /// Reset progress so the next run starts over
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        /// Keep attempt history and escalation reports
        #[arg(long)]
        keep_recovery: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json {
        steadfast::logging::LogFormat::Json
    } else {
        steadfast::logging::LogFormat::Compact
    };
    // A subscriber installed elsewhere is fine
    let _ = steadfast::logging::init_tracing(cli.verbose, format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            fresh,
            max_parallel,
            max_attempts,
            json,
        } => {
            cmd::cmd_run(&cli, project_dir, *fresh, *max_parallel, *max_attempts, *json).await?;
        }
        Commands::Status => cmd::cmd_status(&cli, project_dir)?,
        Commands::Validate => cmd::cmd_validate(&cli, project_dir)?,
        Commands::Reset {
            force,
            keep_recovery,
        } => cmd::cmd_reset(&cli, project_dir, *force, *keep_recovery)?,
    }

    Ok(())
}
