use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::hold::ReviewReport;

/// Custody event counters. All lock-free.
#[derive(Debug, Default)]
pub struct Counters {
    /// Evidence items ingested
    pub ingested: AtomicU64,
    /// Ingests that matched already-logged content
    pub duplicates: AtomicU64,
    /// Entries appended since start, of any type. Mirrors the log's own count
    pub appends: AtomicU64,
    /// Checkpoints signed
    pub checkpoints: AtomicU64,
    /// Tree size at the last append or checkpoint
    pub tree_size: AtomicU64,
    /// Time-stamps granted
    pub tsa_granted: AtomicU64,
    /// Time-stamps deferred to the gap queue
    pub tsa_deferred: AtomicU64,
    /// Items waiting in the gap queue
    pub gap_queue: AtomicU64,
    /// Object versions deleted by retention sweeps
    pub purged: AtomicU64,
    /// Holds placed
    pub holds_placed: AtomicU64,
    /// Holds released or expired
    pub holds_ended: AtomicU64,
    /// Exports that reached `ready`
    pub exports_built: AtomicU64,
    /// Escrow mirrors that failed and were queued again
    pub escrow_failures: AtomicU64,
}

impl Counters {
    /// Adds `n` to a counter
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Overwrites a gauge
    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            ingested: load(&self.ingested),
            duplicates: load(&self.duplicates),
            appends: load(&self.appends),
            checkpoints: load(&self.checkpoints),
            tree_size: load(&self.tree_size),
            tsa_granted: load(&self.tsa_granted),
            tsa_deferred: load(&self.tsa_deferred),
            gap_queue: load(&self.gap_queue),
            purged: load(&self.purged),
            holds_placed: load(&self.holds_placed),
            holds_ended: load(&self.holds_ended),
            exports_built: load(&self.exports_built),
            escrow_failures: load(&self.escrow_failures),
        }
    }
}

/// Serializable copy of [`Counters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CountersSnapshot {
    pub ingested: u64,
    pub duplicates: u64,
    pub appends: u64,
    pub checkpoints: u64,
    pub tree_size: u64,
    pub tsa_granted: u64,
    pub tsa_deferred: u64,
    pub gap_queue: u64,
    pub purged: u64,
    pub holds_placed: u64,
    pub holds_ended: u64,
    pub exports_built: u64,
    pub escrow_failures: u64,
}

/// What the last background cycle did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    /// Cycles run since startup
    pub cycles: u64,
    /// Duration of the last cycle (ms)
    pub last_cycle_ms: u64,
    /// Cycle duration as a fraction of the tick interval
    pub last_cycle_fraction: f64,
    /// When the last cycle finished
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// When the last sweep (gaps, holds, retention) finished
    pub last_sweep_at: Option<DateTime<Utc>>,
    /// Tree size of the last checkpoint the processor signed
    pub last_checkpoint_size: Option<u64>,
}

impl CycleMetrics {
    /// Update metrics after a processing cycle
    #[allow(clippy::cast_precision_loss)]
    pub fn record_cycle(&mut self, elapsed: Duration, interval: Duration, now: DateTime<Utc>) {
        self.cycles += 1;
        self.last_cycle_ms = u64_millis(elapsed.as_millis());
        self.last_cycle_fraction = elapsed.as_millis() as f64 / interval.as_millis().max(1) as f64;
        self.last_cycle_at = Some(now);
    }
}

/// Container for all metrics
#[derive(Default)]
pub struct Metrics {
    /// Custody counters
    pub counters: Counters,
    /// Background cycle metrics
    pub cycle: RwLock<CycleMetrics>,
    /// Proof endpoint latencies
    pub http: HttpMetrics,
    /// Result of the last hold review sweep
    pub review: RwLock<Option<ReviewReport>>,
}

impl Metrics {
    /// Creates an empty container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update cycle metrics
    pub fn update_cycle<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut CycleMetrics),
    {
        update_fn(&mut self.cycle.write());
    }
}

// ============================================================================
// HTTP Metrics (lock-free)
// ============================================================================

/// Latency bucket thresholds in milliseconds
pub const LATENCY_BUCKETS: [u64; 5] = [1, 5, 10, 50, 100];

/// Number of latency buckets (5 thresholds + 1 overflow bucket)
pub const NUM_LATENCY_BUCKETS: usize = 6;

/// Lock-free metrics for a single HTTP endpoint
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    /// Total number of requests
    pub requests: AtomicU64,
    /// Number of requests that resulted in errors
    pub errors: AtomicU64,
    /// Latency buckets: <1ms, <5ms, <10ms, <50ms, <100ms, ≥100ms
    pub latency_buckets: [AtomicU64; NUM_LATENCY_BUCKETS],
}

impl EndpointMetrics {
    /// Record a request with the given latency
    pub fn record(&self, latency: Duration, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_buckets[Self::latency_bucket(latency)].fetch_add(1, Ordering::Relaxed);
    }

    /// Index 0-5 for buckets: <1ms, <5ms, <10ms, <50ms, <100ms, ≥100ms
    fn latency_bucket(latency: Duration) -> usize {
        let ms = u64_millis(latency.as_millis());
        LATENCY_BUCKETS
            .iter()
            .position(|&threshold| ms < threshold)
            .unwrap_or(NUM_LATENCY_BUCKETS - 1)
    }

    /// Get a snapshot of current metrics
    #[must_use]
    pub fn snapshot(&self) -> EndpointMetricsSnapshot {
        EndpointMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency_buckets: std::array::from_fn(|i| self.latency_buckets[i].load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of endpoint metrics (non-atomic, for serialization)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetricsSnapshot {
    /// Total number of requests
    pub requests: u64,
    /// Number of requests that resulted in errors
    pub errors: u64,
    /// Latency bucket counts: <1ms, <5ms, <10ms, <50ms, <100ms, ≥100ms
    pub latency_buckets: [u64; NUM_LATENCY_BUCKETS],
}

/// Lock-free HTTP metrics container for proof endpoints
#[derive(Debug, Default)]
pub struct HttpMetrics {
    /// Metrics for inclusion proof endpoint
    pub inclusion: EndpointMetrics,
    /// Metrics for consistency proof endpoint
    pub consistency: EndpointMetrics,
}

impl HttpMetrics {
    /// Get a snapshot of all HTTP metrics
    #[must_use]
    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            inclusion: self.inclusion.snapshot(),
            consistency: self.consistency.snapshot(),
        }
    }
}

/// Snapshot of all HTTP metrics (for serialization)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMetricsSnapshot {
    /// Metrics for inclusion proof endpoint
    pub inclusion: EndpointMetricsSnapshot,
    /// Metrics for consistency proof endpoint
    pub consistency: EndpointMetricsSnapshot,
}

/// Converts u128 milliseconds to u64, capping at `u64::MAX`
pub(crate) fn u64_millis(millis: u128) -> u64 {
    u64::try_from(millis).unwrap_or(u64::MAX)
}
