//! Snapshot retention sweep
//!
//! Meant to run daily from cron: drop the day directory from
//! `retention_days` ago, then try to remove the month and year parents.
//! `remove_dir` only succeeds on empty directories, so non-empty parents
//! survive untouched.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::minute::Minute;

pub fn run(json_root: &Path, retention_days: i64) -> Result<()> {
    let cutoff = Minute::truncate(Utc::now() - Duration::minutes(1) - Duration::days(retention_days));
    sweep(json_root, &cutoff.day_dir())
}

fn sweep(json_root: &Path, day_dir: &str) -> Result<()> {
    let path = json_root.join(day_dir);
    if !path.exists() {
        return Ok(());
    }
    info!("Dropping {}", path.display());
    fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;

    if let Some(month) = path.parent() {
        let _ = fs::remove_dir(month);
        if let Some(year) = month.parent() {
            let _ = fs::remove_dir(year);
        }
    }
    Ok(())
}
