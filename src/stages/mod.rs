//! Incremental pipeline stages and the trigger loop that drives them.
//!
//! Each stage follows the same write-ahead batch protocol against its own
//! checkpoint:
//!
//! 1. Re-run a pending batch (offset without commit) or plan a new one and
//!    write its offset
//! 2. Skip processing if the output table already has this writer's commit
//!    for the batch
//! 3. Process and append, tagged with `(writer, batch_id)`
//! 4. Write the commit marker
//!
//! Stages share nothing in memory; silver only sees what bronze committed to
//! its table.

pub mod bronze;
pub mod retry;
pub mod silver;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{TriggerKind, TriggerSettings};

pub use bronze::DiscoveryStage;
pub use retry::RetryPolicy;
pub use silver::{EnrichmentStage, TableOffset};

/// What a single batch did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub stage: &'static str,
    pub batch_id: u64,

    /// Rows appended to the output table
    pub records: usize,

    /// Rows appended to the dead-letter table
    pub dead_letters: usize,

    /// Input rows filtered out
    pub dropped: usize,

    /// The batch was a re-run of one planned before a restart
    pub recovered: bool,
}

/// An incremental stage
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Run one batch; `None` when no new input is available
    async fn run_batch(&mut self) -> Result<Option<BatchReport>>;
}

/// When a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Process everything available, then stop
    AvailableNow,

    /// Keep draining on every tick until shutdown
    Continuous { interval: Duration },
}

impl From<&TriggerSettings> for Trigger {
    fn from(settings: &TriggerSettings) -> Self {
        match settings.mode {
            TriggerKind::AvailableNow => Self::AvailableNow,
            TriggerKind::Continuous => Self::Continuous {
                interval: Duration::from_secs(settings.interval_secs),
            },
        }
    }
}

/// Totals across the batches of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: usize,
    pub records: usize,
    pub dead_letters: usize,
    pub dropped: usize,
}

impl RunSummary {
    pub fn add(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.records += report.records;
        self.dead_letters += report.dead_letters;
        self.dropped += report.dropped;
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.batches += other.batches;
        self.records += other.records;
        self.dead_letters += other.dead_letters;
        self.dropped += other.dropped;
    }
}

/// Run batches until no input is left or shutdown is requested
pub async fn drain<S: Stage + ?Sized>(
    stage: &mut S,
    shutdown: &watch::Receiver<bool>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    while !*shutdown.borrow() {
        match stage.run_batch().await? {
            Some(report) => {
                tracing::info!(
                    stage = report.stage,
                    batch_id = report.batch_id,
                    records = report.records,
                    dead_letters = report.dead_letters,
                    dropped = report.dropped,
                    recovered = report.recovered,
                    "Batch committed"
                );
                summary.add(&report);
            }
            None => break,
        }
    }

    Ok(summary)
}

/// Drive `stage` according to `trigger`.
///
/// `wake` carries optional out-of-band nudges (filesystem events) that start
/// a drain before the next tick.
pub async fn run_stage<S: Stage + ?Sized>(
    stage: &mut S,
    trigger: Trigger,
    mut wake: Option<mpsc::Receiver<()>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let period = match trigger {
        Trigger::AvailableNow => return drain(stage, &shutdown).await,
        Trigger::Continuous { interval } => interval,
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial drain replaces it
    ticker.reset();

    let mut summary = RunSummary::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match drain(stage, &shutdown).await {
            Ok(drained) => {
                if drained.batches > 0 {
                    tracing::debug!(stage = stage.name(), batches = drained.batches, "Drained");
                }
                summary.merge(&drained);
            }
            Err(e) => {
                tracing::error!(
                    stage = stage.name(),
                    error = %format!("{:#}", e),
                    "Batch failed, retrying next tick"
                );
            }
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = next_wake(&mut wake) => {
                tracing::debug!(stage = stage.name(), "Woken by storage event");
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(stage = stage.name(), batches = summary.batches, "Stage stopped");
    Ok(summary)
}

/// Resolves on the next wake-up; never resolves without a wake source
async fn next_wake(wake: &mut Option<mpsc::Receiver<()>>) {
    match wake {
        Some(rx) => {
            if rx.recv().await.is_none() {
                // Sender gone: fall back to ticks only
                *wake = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
