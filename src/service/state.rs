use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::export::ExportBuilder;
use crate::hold::LegalHoldManager;
use crate::ingest::IngestPipeline;
use crate::log::TransparencyLog;
use crate::service::metrics::Metrics;
use crate::storage::EvidenceStore;

/// Processor state for graceful shutdown and pause control
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Normal operation: checkpoints and sweeps run on schedule
    Running = 0,
    /// Paused: the processor idles, the server keeps answering
    Paused = 1,
    /// Stopping: the processor exits and the application shuts down
    Stopping = 2,
}

impl ProcessorState {
    /// Converts a u8 value to `ProcessorState`
    ///
    /// Used to read the atomic state value. Unknown values default to Running.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessorState::Paused,
            2 => ProcessorState::Stopping,
            _ => ProcessorState::Running,
        }
    }

    /// Lowercase name used in admin responses
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcessorState::Running => "running",
            ProcessorState::Paused => "paused",
            ProcessorState::Stopping => "stopping",
        }
    }
}

/// Background cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// How often a checkpoint is considered
    pub checkpoint: Duration,
    /// How often gaps, holds and retention are swept
    pub sweep: Duration,
}

/// Shared state between HTTP server and background processor
#[derive(Clone)]
pub struct AppState {
    /// The transparency log
    pub log: Arc<TransparencyLog>,
    /// WORM evidence store
    pub store: Arc<EvidenceStore>,
    /// Legal holds
    pub holds: Arc<LegalHoldManager>,
    /// Export jobs
    pub exports: Arc<ExportBuilder>,
    /// Producer-facing ingest
    pub ingest: Arc<IngestPipeline>,
    /// Counters and latencies
    pub metrics: Arc<Metrics>,
    /// Time source shared by every component
    pub clock: SharedClock,
    /// Processor cadence
    pub schedule: Schedule,
    /// Processor state for graceful shutdown and pause control
    /// 0=Running, 1=Paused, 2=Stopping
    pub processor_state: Arc<AtomicU8>,
}

impl AppState {
    /// Current processor state
    pub fn processor(&self) -> ProcessorState {
        ProcessorState::from_u8(self.processor_state.load(Ordering::Relaxed))
    }

    /// Moves the processor to `state`
    pub fn set_processor(&self, state: ProcessorState) {
        self.processor_state.store(state as u8, Ordering::Relaxed);
    }
}
