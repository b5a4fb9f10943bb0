//! CLI command implementations.
//!
//! | Module  | Commands handled               |
//! |---------|--------------------------------|
//! | `run`   | `Run`                          |
//! | `plan`  | `Status`, `Validate`, `Reset`  |

pub mod plan;
pub mod run;

pub use plan::{cmd_reset, cmd_status, cmd_validate};
pub use run::cmd_run;

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use steadfast::config::Config;

/// Take the exclusive run lock on the state directory.
///
/// The lock is released when the returned file is dropped, including when
/// the process dies.
pub fn acquire_run_lock(config: &Config) -> Result<File> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory: {}",
            config.state_dir.display()
        )
    })?;

    let path = config.lock_file();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    fs2::FileExt::try_lock_exclusive(&file).with_context(|| {
        format!(
            "Another steadfast process is using {} (lock held on {})",
            config.state_dir.display(),
            path.display()
        )
    })?;

    Ok(file)
}
