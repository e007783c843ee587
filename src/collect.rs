//! One collection cycle
//!
//! `Engine` owns the store connection, the aggregator, and the two writers.
//! A cycle is strictly read-then-apply: the store read happens first and any
//! transport failure abandons the cycle before a single aggregator or
//! checkpoint byte changes. The scheduler pattern-matches `CollectError` to
//! tell recoverable store trouble from fatal write failures.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregate::{Aggregator, AggregatorState};
use crate::checkpoint::CheckpointStore;
use crate::config::ProductConfig;
use crate::minute::Minute;
use crate::snapshot::SnapshotWriter;
use crate::store::{MinuteStore, RawRow, StoreError};

#[derive(Debug, Error)]
pub enum CollectError {
    /// Transport or protocol trouble talking to the store. Recoverable: the
    /// scheduler recycles the connection and retries next tick.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Snapshot or checkpoint write failure. Not recoverable in-process.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

pub struct Engine<S> {
    store: S,
    aggregator: Aggregator,
    snapshots: SnapshotWriter,
    checkpoints: CheckpointStore,
    product: ProductConfig,
    last_processed: Option<Minute>,
}

impl<S: MinuteStore> Engine<S> {
    pub fn new(
        store: S,
        aggregator: Aggregator,
        snapshots: SnapshotWriter,
        checkpoints: CheckpointStore,
        product: ProductConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            snapshots,
            checkpoints,
            product,
            last_processed: None,
        }
    }

    pub fn last_processed(&self) -> Option<Minute> {
        self.last_processed
    }

    pub fn state(&self) -> &AggregatorState {
        self.aggregator.state()
    }

    /// Restore checkpointed state, if any. Returns the minute the previous
    /// run last processed.
    pub fn restore(&mut self) -> Option<Minute> {
        let (state, last) = self.checkpoints.load()?;
        self.aggregator.restore(state);
        self.last_processed = Some(last);
        Some(last)
    }

    /// Run one live cycle for `minute`.
    pub async fn collect(&mut self, minute: Minute) -> Result<(), CollectError> {
        info!("Fetching data for {}", minute);
        let key = minute.row_key(&self.product.tag, &self.product.version);
        let rows = self.store.read_minute(&key, &self.product.column_prefix).await?;
        self.apply(minute, &rows)
    }

    /// Replay `count` consecutive minutes starting at `from` with one scan.
    /// Rows are matched to minutes by row key, so a minute missing from the
    /// store never shifts the ones after it.
    pub async fn replay(&mut self, from: Minute, count: u32) -> Result<(), CollectError> {
        let start_key = from.row_key(&self.product.tag, &self.product.version);
        let rows = self
            .store
            .read_minutes(&start_key, &self.product.column_prefix, count)
            .await?;

        let mut by_key: HashMap<String, Vec<RawRow>> = HashMap::new();
        for row in rows {
            by_key.entry(row.key.clone()).or_default().push(row);
        }

        let mut minute = from;
        for _ in 0..count {
            let key = minute.row_key(&self.product.tag, &self.product.version);
            let minute_rows = by_key.remove(&key).unwrap_or_default();
            self.apply(minute, &minute_rows)?;
            minute = minute.succ();
        }
        Ok(())
    }

    /// Fold fetched rows into state, then persist. Only reached after a
    /// successful read; every failure past this point is fatal.
    fn apply(&mut self, minute: Minute, rows: &[RawRow]) -> Result<(), CollectError> {
        let (minute_total, points) = self.aggregator.ingest(minute, rows);
        debug!("Minute {}: {} downloads, {} points", minute, minute_total, points.len());
        self.snapshots
            .write_minute(minute, self.aggregator.state(), &points)?;
        self.checkpoints.save(self.aggregator.state(), minute)?;
        self.last_processed = Some(minute);
        Ok(())
    }

    /// Drop and re-establish the store connection after a transport error.
    pub async fn recycle_store(&mut self) {
        self.store.close().await;
        if let Err(e) = self.store.reopen().await {
            tracing::warn!("Store reopen failed, will retry next tick: {}", e);
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
