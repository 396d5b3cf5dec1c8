// ABOUTME: Cycle scheduler - fires sync cycles on a fixed interval with single-flight gating
// ABOUTME: A tick that finds a cycle still running is skipped rather than queued

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::fetcher::{CycleStats, FetchLoop};

/// What a single tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Completed(CycleStats),
    /// Another cycle held the gate.
    Skipped,
    Failed(anyhow::Error),
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }
}

/// Clears the running flag when the cycle ends, however it ends.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Fires cycles of a `FetchLoop`, at most one at a time.
pub struct CycleScheduler {
    fetch_loop: Arc<FetchLoop>,
    running: AtomicBool,
    cycles: AtomicU64,
    initial_delay: Duration,
    interval: Duration,
}

impl CycleScheduler {
    pub fn new(fetch_loop: Arc<FetchLoop>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            fetch_loop,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            initial_delay,
            // tokio intervals reject a zero period
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn fetch_loop(&self) -> &Arc<FetchLoop> {
        &self.fetch_loop
    }

    /// Whether a cycle currently holds the gate.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                running: &self.running,
            })
    }

    /// Run one cycle unless one is already in flight.
    ///
    /// The snapshot cutoff is taken after the gate is won, so a skipped tick
    /// never observes the clock.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.try_acquire() else {
            tracing::info!("Previous sync cycle still running, skipping this tick");
            return TickOutcome::Skipped;
        };

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_cutoff = Utc::now();
        tracing::info!(
            "Starting sync cycle {} (cutoff {})",
            cycle,
            snapshot_cutoff.to_rfc3339()
        );

        match self.fetch_loop.run_cycle(snapshot_cutoff).await {
            Ok(stats) => {
                tracing::info!(
                    "Sync cycle {} completed: {} page(s), {} record(s) persisted, {} skipped in {}ms",
                    cycle,
                    stats.pages,
                    stats.records_persisted,
                    stats.records_skipped,
                    stats.duration_ms
                );
                if stats.stalled {
                    tracing::warn!(
                        "Sync cycle {} is stalled on a page of malformed records; the watermark cannot advance",
                        cycle
                    );
                }
                TickOutcome::Completed(stats)
            }
            Err(e) => {
                tracing::error!("Sync cycle {} failed: {:#}", cycle, e);
                TickOutcome::Failed(e)
            }
        }
    }

    /// Fire ticks until `shutdown` fires.
    ///
    /// Each tick runs on its own task so the schedule never waits for a slow
    /// cycle; the gate turns the overlap into a skip. Cycles still in flight
    /// at shutdown are aborted. Every record is committed synchronously, so
    /// an abort only ever lands between records.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting scheduler with initial_delay={:?}, interval={:?}",
            self.initial_delay,
            self.interval
        );

        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Vec<JoinHandle<TickOutcome>> = Vec::new();

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    in_flight.retain(|handle| !handle.is_finished());
                    let scheduler = Arc::clone(&self);
                    in_flight.push(tokio::spawn(async move { scheduler.tick().await }));
                }
            }
        }

        for handle in in_flight {
            if !handle.is_finished() {
                tracing::info!("Aborting in-flight sync cycle");
                handle.abort();
            }
        }

        Ok(())
    }
}
