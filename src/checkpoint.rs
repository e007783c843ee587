//! Checkpoint persistence
//!
//! The aggregator state plus the last processed minute, bincode-encoded to a
//! primary file. Before every overwrite the previous primary is copied to
//! `<path>.bak`, so a crash mid-write can destroy at most the primary; the
//! backup still holds the prior cycle. Loading tries primary, then backup,
//! then gives up and reports a cold start. Old schema versions pass through
//! an explicit migration table before acceptance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::aggregate::{AggregatorState, SCHEMA_VERSION};
use crate::minute::Minute;

#[derive(Serialize)]
struct SaveRecord<'a> {
    state: &'a AggregatorState,
    last_minute: Minute,
}

#[derive(Deserialize)]
struct LoadRecord {
    state: AggregatorState,
    last_minute: Minute,
}

/// `(from_version, upgrade)` pairs, applied in sequence until the state
/// reaches the current schema. Each upgrade must bump `schema_version`.
const MIGRATIONS: &[(u32, fn(&mut AggregatorState))] = &[(7, upgrade_7_to_8)];

/// v7 checkpoints carry mirror-bot traffic booked under NA/US/NY/Alfred.
/// Remove its contribution from the running total and the history window,
/// then zero the bucket.
fn upgrade_7_to_8(state: &mut AggregatorState) {
    let alfred = state
        .tree
        .get("NA")
        .and_then(|countries| countries.get("US"))
        .and_then(|regions| regions.get("NY"))
        .and_then(|cities| cities.get("Alfred"))
        .copied()
        .unwrap_or(0);
    info!("Removing {} downloads from Alfred", alfred);
    info!("Adjusting count: {} => {}", state.total, state.total.saturating_sub(alfred));
    state.total = state.total.saturating_sub(alfred);
    for entry in &mut state.history {
        entry.1 = entry.1.saturating_sub(alfred);
    }
    if let Some(count) = state
        .tree
        .get_mut("NA")
        .and_then(|countries| countries.get_mut("US"))
        .and_then(|regions| regions.get_mut("NY"))
        .and_then(|cities| cities.get_mut("Alfred"))
    {
        *count = 0;
    }
    state.schema_version = 8;
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn backup_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".bak");
        PathBuf::from(os)
    }

    /// Persist the state for `minute`. The previous primary survives as the
    /// backup even if we crash before the new primary hits disk.
    pub fn save(&self, state: &AggregatorState, minute: Minute) -> Result<()> {
        info!("Saving state for {}", minute);
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
            }
        }
        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())
                .with_context(|| format!("backing up checkpoint {}", self.path.display()))?;
        }
        let record = SaveRecord { state, last_minute: minute };
        let bytes = bincode::serialize(&record).context("encoding checkpoint")?;
        fs::write(&self.path, bytes)
            .with_context(|| format!("writing checkpoint {}", self.path.display()))?;
        Ok(())
    }

    /// Load the most recent usable checkpoint, or `None` for a cold start.
    /// Read and decode failures are operational, not fatal: primary falls
    /// back to backup, and an unusable pair means starting fresh.
    pub fn load(&self) -> Option<(AggregatorState, Minute)> {
        let record = match self.read(&self.path) {
            Some(record) => Some(record),
            None => {
                let backup = self.backup_path();
                if backup.exists() {
                    info!("Loading backup checkpoint");
                }
                self.read(&backup)
            }
        }?;

        let LoadRecord { state, last_minute } = record;
        let state = migrate(state)?;
        info!("Restored state for {} (total {})", last_minute, state.total);
        Some((state, last_minute))
    }

    fn read(&self, path: &Path) -> Option<LoadRecord> {
        if !path.exists() {
            return None;
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Trouble reading checkpoint {}: {}", path.display(), e);
                return None;
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Trouble decoding checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn migrate(mut state: AggregatorState) -> Option<AggregatorState> {
    for (from, upgrade) in MIGRATIONS {
        if state.schema_version == *from {
            info!("Upgrading checkpoint schema v{}", from);
            upgrade(&mut state);
        }
    }
    if state.schema_version == SCHEMA_VERSION {
        Some(state)
    } else {
        warn!(
            "Discarding checkpoint with unsupported schema v{} (want v{})",
            state.schema_version, SCHEMA_VERSION
        );
        None
    }
}
