//! Background loop: periodic checkpoints plus the gap, hold, retention and
//! escrow sweeps.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::hold::{MirrorSweep, ReviewReport};
use crate::ingest::GapReport;
use crate::log::Checkpoint;
use crate::service::metrics::Counters;
use crate::service::state::{AppState, ProcessorState};
use crate::storage::PurgeReport;

/// Longest the loop sleeps before re-reading its state.
const MAX_TICK: Duration = Duration::from_secs(1);

/// What one sweep did. A failed step leaves its field at the default and
/// adds a line to `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Gap-closing result
    pub gaps: GapReport,
    /// Ids of holds that expired
    pub expired_holds: Vec<String>,
    /// Holds approaching expiry
    pub review: ReviewReport,
    /// Retention purge result
    pub purge: PurgeReport,
    /// Escrow mirrors collected this sweep
    pub mirrors: MirrorSweep,
    /// Steps that failed
    pub errors: Vec<String>,
}

/// Runs until the processor state becomes `Stopping`.
pub async fn run_processor(state: AppState) {
    let tick = state.schedule.checkpoint.min(state.schedule.sweep).min(MAX_TICK);
    let mut last_checkpoint = Instant::now();
    let mut last_sweep = Instant::now();
    info!(
        checkpoint_secs = state.schedule.checkpoint.as_secs(),
        sweep_secs = state.schedule.sweep.as_secs(),
        "background processor started"
    );

    loop {
        match state.processor() {
            ProcessorState::Paused => {
                tokio::time::sleep(tick).await;
                continue;
            }
            ProcessorState::Stopping => break,
            ProcessorState::Running => {}
        }

        let started = Instant::now();
        let mut worked = false;
        if last_checkpoint.elapsed() >= state.schedule.checkpoint {
            last_checkpoint = Instant::now();
            worked = true;
            if let Err(e) = checkpoint_if_grown(&state).await {
                warn!(error = %e, "scheduled checkpoint failed");
            }
        }
        if last_sweep.elapsed() >= state.schedule.sweep {
            last_sweep = Instant::now();
            worked = true;
            sweep(&state).await;
        }
        if worked {
            let elapsed = started.elapsed();
            let now = state.clock.now();
            state.metrics.update_cycle(|cycle| cycle.record_cycle(elapsed, tick, now));
        }

        tokio::time::sleep(tick).await;
    }

    info!("background processor stopped");
}

/// Signs a checkpoint when the tree grew past the latest one.
///
/// # Errors
///
/// Returns the log's error if signing or persisting fails.
pub async fn checkpoint_if_grown(state: &AppState) -> Result<Option<Checkpoint>> {
    let size = state.log.size();
    let last = state.log.latest_checkpoint().map_or(0, |c| c.tree_size);
    if size == 0 || size <= last {
        return Ok(None);
    }
    let checkpoint = state.log.checkpoint().await?;
    Counters::add(&state.metrics.counters.checkpoints, 1);
    Counters::set(&state.metrics.counters.tree_size, checkpoint.tree_size);
    state
        .metrics
        .update_cycle(|cycle| cycle.last_checkpoint_size = Some(checkpoint.tree_size));
    Ok(Some(checkpoint))
}

/// Closes time-stamp gaps, expires and reviews holds, and purges versions
/// past retention. Steps run independently.
pub async fn sweep(state: &AppState) -> SweepReport {
    let counters = &state.metrics.counters;
    let mut report = SweepReport::default();

    match state.ingest.close_gaps().await {
        Ok(gaps) => {
            Counters::add(&counters.tsa_granted, gaps.stamped.len() as u64);
            report.gaps = gaps;
        }
        Err(e) => note(&mut report, "gap-closing", &e),
    }
    Counters::set(&counters.gap_queue, state.ingest.pending() as u64);

    match state.holds.expire().await {
        Ok(expired) => {
            Counters::add(&counters.holds_ended, expired.len() as u64);
            report.expired_holds = expired.into_iter().map(|hold| hold.id).collect();
        }
        Err(e) => note(&mut report, "hold expiry", &e),
    }

    report.review = state.holds.review().await;
    *state.metrics.review.write() = Some(report.review.clone());

    match state.store.purge_expired().await {
        Ok(purge) => {
            Counters::add(&counters.purged, purge.deleted.len() as u64);
            report.purge = purge;
        }
        Err(e) => note(&mut report, "retention purge", &e),
    }

    report.mirrors = state.holds.drain_mirrors().await;
    Counters::add(&counters.escrow_failures, report.mirrors.failed.len() as u64);
    for failure in &report.mirrors.failed {
        report.errors.push(format!("escrow mirror: {failure}"));
    }

    let now = state.clock.now();
    state.metrics.update_cycle(|cycle| cycle.last_sweep_at = Some(now));
    info!(
        stamped = report.gaps.stamped.len(),
        expired_holds = report.expired_holds.len(),
        review = report.review.len(),
        purged = report.purge.deleted.len(),
        mirrored = report.mirrors.copied,
        failures = report.errors.len(),
        "sweep finished"
    );
    report
}

fn note(report: &mut SweepReport, step: &str, e: &crate::Error) {
    warn!(step, error = %e, kind = %e.kind(), "sweep step failed");
    report.errors.push(format!("{step}: {e}"));
}
