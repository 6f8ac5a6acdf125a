//! Engine: composition root for one device/model context.
//!
//! Owns the worker pool, the four buffer pools and the quiescence timer. The
//! open batch lives inside the timer's lock, so [`Engine::submit`],
//! [`Engine::force_flush`] and a forced seal from the timer thread are
//! serialized.
//!
//! # Shutdown contract
//!
//! Dropping the engine disarms the timer *without* sealing the open batch and
//! then shuts the worker pool down, dropping any queued task. Call
//! [`Engine::force_flush`] and wait on every [`ItemHandle`] first. Handles of
//! items that never ran are still released, with their outcome left
//! `Pending`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info};

use batchline_core::backend::InferenceDevice;
use batchline_core::error::{EngineError, Result};
use batchline_core::signal::Completion;
use batchline_core::stage_traits::{
    Delivery, EventSink, ObjectFilter, Postprocessor, Preprocessor, TracingEvents,
};
use batchline_core::timer::{QuiescenceTimer, TimerState};
use batchline_core::types::{BatchItem, Frame, ItemOutcome};
use batchline_core::worker::{PoolStats, WorkerPool};

use crate::config::EngineConfig;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::stages::{Admission, BufferPools, DoneGuard, SealTrigger, StageSet};

// ─── Collaborators ───────────────────────────────────────────────────────────

/// Pluggable implementations chosen at construction.
pub struct Collaborators {
    pub device: Arc<dyn InferenceDevice>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub postprocessor: Arc<dyn Postprocessor>,
    /// Required in object mode to select objects; all accepted when absent.
    pub object_filter: Option<Arc<dyn ObjectFilter>>,
    pub delivery: Option<Arc<dyn Delivery>>,
    pub events: Arc<dyn EventSink>,
}

impl Collaborators {
    pub fn new(
        device: Arc<dyn InferenceDevice>,
        preprocessor: Arc<dyn Preprocessor>,
        postprocessor: Arc<dyn Postprocessor>,
    ) -> Self {
        Self {
            device,
            preprocessor,
            postprocessor,
            object_filter: None,
            delivery: None,
            events: Arc::new(TracingEvents),
        }
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_object_filter(mut self, filter: Arc<dyn ObjectFilter>) -> Self {
        self.object_filter = Some(filter);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

// ─── Item handle ─────────────────────────────────────────────────────────────

/// Returned by [`Engine::submit`]; done once every item created for the frame
/// has finished its chain.
///
/// Done means finished, not succeeded: inspect [`ItemHandle::items`] or
/// [`ItemHandle::succeeded`] afterwards.
#[derive(Clone, Debug)]
pub struct ItemHandle {
    frame: Arc<Frame>,
    items: Vec<Arc<BatchItem>>,
    done: Completion<()>,
}

impl ItemHandle {
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn items(&self) -> &[Arc<BatchItem>] {
        &self.items
    }

    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub fn wait(&self) {
        self.done.wait();
    }

    /// Returns whether the handle completed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout).is_some()
    }

    /// Every item either succeeded or was skipped.
    pub fn succeeded(&self) -> bool {
        self.items.iter().all(|item| {
            matches!(
                item.outcome(),
                ItemOutcome::Succeeded | ItemOutcome::Skipped
            )
        })
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Engine {
    config: EngineConfig,
    stages: Arc<StageSet>,
    workers: Arc<WorkerPool>,
    object_filter: Option<Arc<dyn ObjectFilter>>,
    timer: QuiescenceTimer<Admission>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            device,
            preprocessor,
            postprocessor,
            object_filter,
            delivery,
            events,
        } = collaborators;

        let shape = device.model_shape();
        shape.validate()?;
        preprocessor.on_shape_known(&shape, &config.preproc_params())?;
        postprocessor.on_shape_known(&shape, &config.postproc_params())?;

        let pool_config = config.worker_pool_config();
        let workers = Arc::new(WorkerPool::init(pool_config, events)?);

        let stages = Arc::new(StageSet {
            device: device.clone(),
            preprocessor,
            postprocessor,
            delivery,
            pools: BufferPools::new(config.batch_size, &shape),
            metrics: PipelineMetrics::new(),
        });

        let admission = Admission::new(stages.clone(), workers.clone(), config.batch_size);
        let timer = QuiescenceTimer::new(
            Duration::from_millis(config.batching_timeout_ms),
            admission,
        )?;

        info!(
            device = device.name(),
            batch_size = config.batch_size,
            timeout_ms = config.batching_timeout_ms,
            threads = pool_config.threads,
            capacity = pool_config.capacity,
            object_infer = config.object_infer,
            "Engine ready"
        );

        Ok(Self {
            config,
            stages,
            workers,
            object_filter,
            timer,
        })
    }

    /// Admit one frame.
    ///
    /// EOS frames flush the open batch. EOS frames, frames skipped by the
    /// inference interval and frames with no accepted object in object mode
    /// bypass inference as `Skipped`, but are still delivered in submission
    /// order: their handles complete once everything submitted before them
    /// has been delivered.
    pub fn submit(&self, frame: Arc<Frame>) -> Result<ItemHandle> {
        if !frame.eos {
            frame.descriptor.validate(frame.data.len())?;
        }
        if !self.workers.is_running() {
            return Err(EngineError::Shutdown);
        }

        let mut op = self.timer.lock();
        if frame.eos {
            op.disarm();
            op.seal(SealTrigger::Flush)?;
            return self.skip(&mut op, frame);
        }
        if !op.next_frame_inferred(self.config.infer_interval) {
            return self.skip(&mut op, frame);
        }

        let items = self.items_for(&frame);
        if items.is_empty() {
            return self.skip(&mut op, frame);
        }

        let done = Completion::new();
        let guard = DoneGuard::new(done.clone());
        let admitted = items
            .iter()
            .try_for_each(|item| op.admit(item.clone(), guard.clone()));
        drop(guard);

        // Items admitted before a failure still need a seal.
        if op.is_empty() {
            op.disarm();
        } else if self.config.batching_timeout_ms > 0 {
            op.arm(|admission| admission.seal_or_log(SealTrigger::Timeout));
        }
        admitted?;

        Ok(ItemHandle { frame, items, done })
    }

    fn items_for(&self, frame: &Arc<Frame>) -> Vec<Arc<BatchItem>> {
        if !self.config.object_infer {
            return vec![Arc::new(BatchItem::frame(frame.clone()))];
        }
        frame
            .objects
            .iter()
            .filter(|object| {
                self.object_filter
                    .as_ref()
                    .is_none_or(|filter| filter.accept(frame, object))
            })
            .map(|object| Arc::new(BatchItem::object(frame.clone(), object.clone())))
            .collect()
    }

    fn skip(&self, admission: &mut Admission, frame: Arc<Frame>) -> Result<ItemHandle> {
        let item = Arc::new(BatchItem::frame(frame.clone()));
        item.set_outcome(ItemOutcome::Skipped);
        self.stages
            .metrics
            .items_skipped
            .fetch_add(1, Ordering::Relaxed);

        let done = Completion::new();
        admission.skip(item.clone(), DoneGuard::new(done.clone()))?;
        debug!(
            stream = %frame.stream_id,
            frame_id = frame.frame_id,
            eos = frame.eos,
            "Frame bypassed inference"
        );
        Ok(ItemHandle {
            frame,
            items: vec![item],
            done,
        })
    }

    /// Seal the open batch now and disarm the timer. No-op when empty.
    pub fn force_flush(&self) -> Result<()> {
        let mut op = self.timer.lock();
        op.disarm();
        op.seal(SealTrigger::Flush)
    }

    /// Items waiting in the open batch.
    pub fn pending(&self) -> usize {
        self.timer.lock().pending()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.stages.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stages.metrics.snapshot()
    }

    pub fn worker_stats(&self) -> &PoolStats {
        self.workers.stats()
    }

    pub fn timer_state(&self) -> TimerState {
        self.timer.state()
    }

    /// Forced seals fired by the quiescence timer.
    pub fn timeouts_fired(&self) -> u64 {
        self.timer.fired()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        {
            let mut op = self.timer.lock();
            if op.pending() > 0 {
                debug!(pending = op.pending(), "Engine dropped with an open batch");
            }
            op.disarm();
        }
        self.timer.shutdown();
        self.workers.shutdown();
        self.stages.metrics.report();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("timer", &self.timer)
            .field("workers", &self.workers)
            .finish()
    }
}
