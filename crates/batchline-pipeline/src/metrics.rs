//! Atomic pipeline counters and stage latency totals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::info;

/// Stages timed by [`PipelineMetrics::record_stage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    StageIn,
    Invoke,
    StageOut,
    Extract,
    Deliver,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::StageIn => "stage_in",
            Self::Invoke => "invoke",
            Self::StageOut => "stage_out",
            Self::Extract => "extract",
            Self::Deliver => "deliver",
        }
    }
}

/// Run count and cumulative wall-clock time of one stage.
#[derive(Debug, Default)]
pub struct StageTiming {
    pub runs: AtomicU64,
    pub total_us: AtomicU64,
}

impl StageTiming {
    fn record(&self, elapsed_us: u64) {
        self.total_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean microseconds per timed run, zero before the first run.
    pub fn avg_us(&self) -> u64 {
        let runs = self.runs.load(Ordering::Relaxed);
        if runs == 0 {
            return 0;
        }
        self.total_us.load(Ordering::Relaxed) / runs
    }
}

/// Atomic per-stage item counts and latency tracking.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Items admitted into a batch.
    pub items_submitted: AtomicU64,
    /// Frames completed without inference (EOS markers, interval skips, no
    /// accepted objects).
    pub items_skipped: AtomicU64,
    /// Preparation bodies that succeeded.
    pub items_prepared: AtomicU64,
    /// Extraction bodies that ran, whatever their outcome.
    pub items_extracted: AtomicU64,
    /// Items whose outcome ended up `Failed`.
    pub items_failed: AtomicU64,
    /// Items handed to the delivery collaborator, skipped ones included.
    pub items_delivered: AtomicU64,
    /// Batches whose stage chain was submitted.
    pub batches_sealed: AtomicU64,
    /// Subset of `batches_sealed` sealed by the quiescence timer.
    pub batches_sealed_by_timeout: AtomicU64,
    /// Stage bodies that returned an error.
    pub stage_failures: AtomicU64,
    pub prepare: StageTiming,
    pub stage_in: StageTiming,
    pub invoke: StageTiming,
    pub stage_out: StageTiming,
    pub extract: StageTiming,
    pub deliver: StageTiming,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub items_submitted: u64,
    pub items_skipped: u64,
    pub items_prepared: u64,
    pub items_extracted: u64,
    pub items_failed: u64,
    pub items_delivered: u64,
    pub batches_sealed: u64,
    pub batches_sealed_by_timeout: u64,
    pub stage_failures: u64,
}

impl PipelineMetrics {
    /// Allocate a fresh [`PipelineMetrics`] with all counters zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn timing(&self, stage: Stage) -> &StageTiming {
        match stage {
            Stage::Prepare => &self.prepare,
            Stage::StageIn => &self.stage_in,
            Stage::Invoke => &self.invoke,
            Stage::StageOut => &self.stage_out,
            Stage::Extract => &self.extract,
            Stage::Deliver => &self.deliver,
        }
    }

    /// Time one stage run, failed runs included.
    pub fn record_stage(&self, stage: Stage, started: Instant) {
        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.timing(stage).record(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Acquire),
            items_skipped: self.items_skipped.load(Ordering::Acquire),
            items_prepared: self.items_prepared.load(Ordering::Acquire),
            items_extracted: self.items_extracted.load(Ordering::Acquire),
            items_failed: self.items_failed.load(Ordering::Acquire),
            items_delivered: self.items_delivered.load(Ordering::Acquire),
            batches_sealed: self.batches_sealed.load(Ordering::Acquire),
            batches_sealed_by_timeout: self.batches_sealed_by_timeout.load(Ordering::Acquire),
            stage_failures: self.stage_failures.load(Ordering::Acquire),
        }
    }

    /// Validate ordering invariants. Should hold once every handle is done.
    pub fn validate(&self) -> bool {
        let snap = self.snapshot();
        snap.items_submitted >= snap.items_extracted
            && snap.items_extracted + snap.items_skipped >= snap.items_delivered
            && snap.batches_sealed >= snap.batches_sealed_by_timeout
    }

    /// Report stage latencies (avg microseconds).
    pub fn report(&self) {
        let snap = self.snapshot();
        info!(
            items = snap.items_submitted,
            batches = snap.batches_sealed,
            timeouts = snap.batches_sealed_by_timeout,
            failed = snap.items_failed,
            prepare_avg_us = self.prepare.avg_us(),
            stage_in_avg_us = self.stage_in.avg_us(),
            invoke_avg_us = self.invoke.avg_us(),
            stage_out_avg_us = self.stage_out.avg_us(),
            extract_avg_us = self.extract.avg_us(),
            deliver_avg_us = self.deliver.avg_us(),
            "Stage latencies"
        );
    }
}
