//! Process-lifetime collection loop
//!
//! One cycle per wall-clock minute: wait for the settle offset, collect the
//! minute, sleep to the next tick. On startup the checkpoint gap is replayed
//! chunk by chunk, recomputing against the wall clock between chunks so a
//! long catch-up converges even while time keeps moving. A transport error
//! recycles the store connection and tries again next tick; only write
//! failures stop the process.

use anyhow::Result;
use chrono::{Duration, Timelike, Utc};
use tracing::{error, info};

use crate::collect::{CollectError, Engine};
use crate::config::CollectorConfig;
use crate::minute::Minute;
use crate::store::MinuteStore;

/// Restore state, then loop forever. Returns only on a fatal write error;
/// operator signals terminate the process outside this function.
pub async fn run<S: MinuteStore>(
    engine: &mut Engine<S>,
    collector: &CollectorConfig,
) -> Result<()> {
    if engine.restore().is_none() {
        info!("No usable checkpoint, starting cold");
    }
    info!("Looping, infinitely.");
    loop {
        match cycle(engine, collector).await {
            Ok(()) => {}
            Err(CollectError::Store(e)) => {
                error!("Recycling store connection: {}", e);
                engine.recycle_store().await;
            }
            Err(CollectError::Fatal(e)) => return Err(e),
        }
    }
}

/// One pass of the loop: replay part of a backlog if we are behind, wait out
/// the minute after a same-minute restart, or run a normal tick.
async fn cycle<S: MinuteStore>(
    engine: &mut Engine<S>,
    collector: &CollectorConfig,
) -> Result<(), CollectError> {
    let cur = Minute::collection_now();
    if replay_gap(engine, cur, collector.catchup_chunk).await? {
        // Re-enter so the gap is recomputed; the clock may have rolled
        // forward while we replayed.
        return Ok(());
    }
    if engine.last_processed() >= Some(cur) {
        // Restarted inside an already-processed minute (or the clock
        // stepped back). Never count a minute twice.
        info!("Waiting for the minute to roll over.");
        sleep_until_rollover().await;
        return Ok(());
    }

    wait_settle(collector.settle_second).await;

    let minute = Minute::collection_now();
    if engine.last_processed() >= Some(minute) {
        return Ok(());
    }
    engine.collect(minute).await?;
    wait_next_tick(minute, collector.settle_second).await;
    Ok(())
}

/// Replay up to one chunk of the gap between the checkpoint and `cur`,
/// covering minutes `last + 1` up to but never including `cur`. Returns
/// whether anything was replayed.
async fn replay_gap<S: MinuteStore>(
    engine: &mut Engine<S>,
    cur: Minute,
    chunk: u32,
) -> Result<bool, CollectError> {
    let Some(last) = engine.last_processed() else {
        return Ok(false);
    };
    let gap = cur.minutes_since(last);
    if gap <= 1 {
        return Ok(false);
    }
    let missed = gap - 1;
    info!("Missing {} minutes. Catching up.", missed);
    let count = missed.min(i64::from(chunk)) as u32;
    engine.replay(last.succ(), count).await?;
    Ok(true)
}

/// Hold off reading a fresh minute until `settle_second` past the boundary,
/// giving the store's ingestion pipeline time to finish writing it.
async fn wait_settle(settle_second: u32) {
    let sec = Utc::now().second();
    if sec < settle_second {
        info!("Waiting until :{} past.", settle_second);
        tokio::time::sleep(std::time::Duration::from_secs(u64::from(settle_second - sec))).await;
    }
}

/// Sleep until the next minute's settle point. A delay outside (0, 60]
/// seconds means the clock already rolled past the tick (a slow cycle), so
/// skip sleeping and tick immediately rather than oversleep.
async fn wait_next_tick(minute: Minute, settle_second: u32) {
    // `minute` is one behind the wall clock, so the next tick fires two
    // minutes after its start.
    let target = minute.succ().succ().as_datetime() + Duration::seconds(i64::from(settle_second));
    let secs = (target - Utc::now()).num_seconds();
    if secs > 0 && secs <= 60 {
        info!("Sleeping for {} seconds.", secs);
        tokio::time::sleep(std::time::Duration::from_secs(secs as u64)).await;
    } else {
        info!("Skipping sleep.");
    }
}

async fn sleep_until_rollover() {
    let sec = Utc::now().second().min(59);
    tokio::time::sleep(std::time::Duration::from_secs(u64::from(60 - sec))).await;
}
