//! Batch admission and stage chain construction.
//!
//! # Stage chain
//!
//! ```text
//!  submit ─► prepare[k] ──┐            (host_in, shared turn per batch)
//!                         ▼
//!  seal ───► stage_in ──► invoke ──► stage_out ──► extract[k] ──► deliver
//!           host_in       dev_in     dev_out       host_out        (after the
//!           dev_in        dev_out    host_out      (shared turn     previous
//!                                                   per batch)      deliver)
//! ```
//!
//! Preparation nodes are submitted as items arrive; the rest of the chain is
//! built and submitted when the batch seals. Every ticket is taken on the
//! admitting thread, in submission order, while the engine lock is held, so
//! a task only ever waits on turns and dependencies of tasks submitted
//! before it.
//!
//! # Delivery order
//!
//! Items reach the delivery sink in admission order. Each seal adds one
//! deliver node that waits for the batch's extractions and for the previous
//! deliver node, then hands over the outbox: the batch's items plus any
//! skipped item admitted while the batch was open. A skipped item admitted
//! with no open batch gets a deliver node of its own.
//!
//! # Failure handling
//!
//! A failing stage body returns its error (reported once by the worker
//! pool) and the chain keeps flowing. Extraction inspects the upstream
//! statuses of its slot and marks the item `Failed` without reporting again.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, warn};

use batchline_core::backend::{InferenceDevice, ModelShape};
use batchline_core::error::{EngineError, Result};
use batchline_core::resource::{BatchBuffer, ResourcePool};
use batchline_core::signal::Completion;
use batchline_core::stage_traits::{Delivery, Postprocessor, Preprocessor};
use batchline_core::task::{CompletionHandle, Task, TaskStatus};
use batchline_core::ticket::{Lease, Ticket};
use batchline_core::types::{BatchItem, ItemOutcome};
use batchline_core::worker::WorkerPool;

use crate::metrics::{PipelineMetrics, Stage};

// ─── Shared stage state ──────────────────────────────────────────────────────

/// The four buffers a batch moves through.
pub(crate) struct BufferPools {
    pub host_in: ResourcePool<BatchBuffer>,
    pub dev_in: ResourcePool<BatchBuffer>,
    pub dev_out: ResourcePool<BatchBuffer>,
    pub host_out: ResourcePool<BatchBuffer>,
}

impl BufferPools {
    pub fn new(batch_size: usize, shape: &ModelShape) -> Self {
        Self {
            host_in: ResourcePool::new(
                "host_in",
                BatchBuffer::new("host_in", batch_size, &shape.input_bytes),
            ),
            dev_in: ResourcePool::new(
                "dev_in",
                BatchBuffer::new("dev_in", batch_size, &shape.input_bytes),
            ),
            dev_out: ResourcePool::new(
                "dev_out",
                BatchBuffer::new("dev_out", batch_size, &shape.output_bytes),
            ),
            host_out: ResourcePool::new(
                "host_out",
                BatchBuffer::new("host_out", batch_size, &shape.output_bytes),
            ),
        }
    }
}

/// Everything a stage body touches, shared by reference count.
pub(crate) struct StageSet {
    pub device: Arc<dyn InferenceDevice>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub postprocessor: Arc<dyn Postprocessor>,
    pub delivery: Option<Arc<dyn Delivery>>,
    pub pools: BufferPools,
    pub metrics: Arc<PipelineMetrics>,
}

impl StageSet {
    /// Hand a finished item downstream.
    pub fn deliver(&self, item: &BatchItem) {
        if let Some(delivery) = &self.delivery {
            delivery.deliver(item);
            self.metrics.items_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record(&self, stage: Stage, started: Instant, result: &Result<()>) {
        self.metrics.record_stage(stage, started);
        if result.is_err() {
            self.metrics.stage_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─── Done guard ──────────────────────────────────────────────────────────────

/// Signals a frame's completion when the last clone is dropped.
///
/// Every item created for a frame holds a clone until it has been handed to
/// the delivery sink, or until its deliver node is dropped unrun.
pub(crate) struct DoneGuard {
    done: Completion<()>,
}

impl DoneGuard {
    pub fn new(done: Completion<()>) -> Arc<Self> {
        Arc::new(Self { done })
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.done.set(());
    }
}

// ─── Admission ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SealTrigger {
    /// The batch reached its target size.
    Size,
    /// The quiescence window elapsed.
    Timeout,
    /// Explicit flush (EOS or caller).
    Flush,
}

impl SealTrigger {
    fn label(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Flush => "flush",
        }
    }
}

struct OpenSlot {
    item: Arc<BatchItem>,
    prepared: CompletionHandle,
}

/// An item waiting for its turn at the delivery sink.
struct Outgoing {
    item: Arc<BatchItem>,
    done: Arc<DoneGuard>,
}

/// The open batch plus what sealing needs. Lives inside the quiescence
/// timer so admission and forced sealing share one lock.
pub(crate) struct Admission {
    stages: Arc<StageSet>,
    workers: Arc<WorkerPool>,
    batch_size: usize,
    open: Vec<OpenSlot>,
    /// Items to deliver once the open batch is extracted, in admission order.
    outbox: Vec<Outgoing>,
    /// Reservation on the open batch's host_in turn.
    prep_lease: Option<Lease>,
    /// Stage-in node of the last sealed batch; it vacates host_in.
    prev_stage_in: Option<CompletionHandle>,
    prev_deliver: Option<CompletionHandle>,
    next_batch_id: u64,
    frames_seen: u64,
}

impl Admission {
    pub fn new(stages: Arc<StageSet>, workers: Arc<WorkerPool>, batch_size: usize) -> Self {
        Self {
            stages,
            workers,
            batch_size,
            open: Vec::with_capacity(batch_size),
            outbox: Vec::with_capacity(batch_size),
            prep_lease: None,
            prev_stage_in: None,
            prev_deliver: None,
            next_batch_id: 0,
            frames_seen: 0,
        }
    }

    /// Items waiting in the open batch.
    pub fn pending(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Count one non-EOS frame; returns whether it should be inferred.
    pub fn next_frame_inferred(&mut self, interval: u32) -> bool {
        let seen = self.frames_seen;
        self.frames_seen += 1;
        interval <= 1 || seen % u64::from(interval) == 0
    }

    /// Append `item` to the open batch and submit its preparation node.
    /// Seals the batch when it reaches its target size.
    pub fn admit(&mut self, item: Arc<BatchItem>, done: Arc<DoneGuard>) -> Result<()> {
        if self.open.len() >= self.batch_size {
            return Err(EngineError::BatchOverflow {
                capacity: self.batch_size,
            });
        }

        let slot = self.open.len();
        let fills_batch = slot + 1 == self.batch_size;
        let claim = self
            .stages
            .pools
            .host_in
            .acquire(self.prep_lease.take(), !fills_batch);
        self.prep_lease = claim.lease;

        let ticket = claim.ticket.clone();
        let mut task = prepare_task(self.stages.clone(), item.clone(), slot, claim.ticket);
        task.depends_on(self.prev_stage_in.as_ref());
        let prepared = task.completion();
        if let Err(err) = self.workers.submit(task) {
            // The task was dropped unrun and will never enter its turn.
            self.stages.pools.host_in.abandon(&ticket);
            return Err(err);
        }

        self.open.push(OpenSlot {
            item: item.clone(),
            prepared,
        });
        self.outbox.push(Outgoing { item, done });
        self.stages
            .metrics
            .items_submitted
            .fetch_add(1, Ordering::Relaxed);

        if fills_batch {
            self.seal(SealTrigger::Size)?;
        }
        Ok(())
    }

    /// Queue an item that bypasses inference for delivery behind everything
    /// admitted before it.
    pub fn skip(&mut self, item: Arc<BatchItem>, done: Arc<DoneGuard>) -> Result<()> {
        self.outbox.push(Outgoing { item, done });
        if !self.open.is_empty() {
            return Ok(());
        }
        let deliver = self.deliver_node(&[]);
        self.workers.submit(deliver)
    }

    /// Build the deliver node for the current outbox.
    fn deliver_node(&mut self, extracted: &[CompletionHandle]) -> Task {
        let outgoing = mem::take(&mut self.outbox);
        let mut task = deliver_task(self.stages.clone(), outgoing);
        task.depends_on_all(extracted);
        task.depends_on(self.prev_deliver.as_ref());
        self.prev_deliver = Some(task.completion());
        task
    }

    /// Close the open batch and submit its stage chain. No-op when empty.
    pub fn seal(&mut self, trigger: SealTrigger) -> Result<()> {
        // Releasing the reservation lets stage-in queue right behind the
        // preparations already admitted.
        drop(self.prep_lease.take());
        if self.open.is_empty() {
            return Ok(());
        }

        let slots = mem::take(&mut self.open);
        let items = slots.len();
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let stages = &self.stages;
        let pools = &stages.pools;

        let mut stage_in = stage_in_task(
            stages.clone(),
            items,
            pools.host_in.acquire(None, false).ticket,
            pools.dev_in.acquire(None, false).ticket,
        );
        stage_in.depends_on_all(slots.iter().map(|slot| &slot.prepared));
        let stage_in_done = stage_in.completion();

        let mut invoke = invoke_task(
            stages.clone(),
            items,
            pools.dev_in.acquire(None, false).ticket,
            pools.dev_out.acquire(None, false).ticket,
        );
        invoke.depends_on(Some(&stage_in_done));
        let invoke_done = invoke.completion();

        let mut stage_out = stage_out_task(
            stages.clone(),
            items,
            pools.dev_out.acquire(None, false).ticket,
            pools.host_out.acquire(None, false).ticket,
        );
        stage_out.depends_on(Some(&invoke_done));
        let stage_out_done = stage_out.completion();

        let mut chain = Vec::with_capacity(items + 4);
        let mut extracted = Vec::with_capacity(items);
        chain.push(stage_in);
        chain.push(invoke);
        chain.push(stage_out);

        let mut lease = None;
        for (index, slot) in slots.into_iter().enumerate() {
            let last = index + 1 == items;
            let claim = pools.host_out.acquire(lease.take(), !last);
            lease = claim.lease;

            let upstream = Upstream {
                prepare: slot.prepared,
                stage_in: stage_in_done.clone(),
                invoke: invoke_done.clone(),
                stage_out: stage_out_done.clone(),
            };
            let mut extract = extract_task(
                stages.clone(),
                slot.item,
                index,
                claim.ticket,
                upstream,
            );
            extract.depends_on(Some(&stage_out_done));
            extracted.push(extract.completion());
            chain.push(extract);
        }

        self.prev_stage_in = Some(stage_in_done);
        stages.metrics.batches_sealed.fetch_add(1, Ordering::Relaxed);
        if trigger == SealTrigger::Timeout {
            stages
                .metrics
                .batches_sealed_by_timeout
                .fetch_add(1, Ordering::Relaxed);
        }
        debug!(batch_id, items, trigger = trigger.label(), "Batch sealed");

        chain.push(self.deliver_node(&extracted));
        self.workers.submit_all(chain)
    }

    /// [`seal`](Self::seal) for callers with nowhere to return the error.
    pub fn seal_or_log(&mut self, trigger: SealTrigger) {
        if let Err(err) = self.seal(trigger) {
            warn!(trigger = trigger.label(), error = %err, "Batch seal failed");
        }
    }
}

// ─── Stage bodies ────────────────────────────────────────────────────────────

fn prepare_task(stages: Arc<StageSet>, item: Arc<BatchItem>, slot: usize, ticket: Ticket) -> Task {
    Task::new(Stage::Prepare.label(), move |_ctx| {
        let buffer = stages.pools.host_in.enter(&ticket);
        let started = Instant::now();
        let result = prepare_slot(stages.preprocessor.as_ref(), &buffer, &item, slot);
        stages.record(Stage::Prepare, started, &result);
        if result.is_ok() {
            stages.metrics.items_prepared.fetch_add(1, Ordering::Relaxed);
        }
        result
    })
}

fn prepare_slot(
    preprocessor: &dyn Preprocessor,
    buffer: &BatchBuffer,
    item: &BatchItem,
    slot: usize,
) -> Result<()> {
    let mut view = buffer.view(slot)?;
    let mut inputs = view.tensors_mut();
    preprocessor.prepare(item, slot, &mut inputs)
}

fn stage_in_task(stages: Arc<StageSet>, items: usize, host: Ticket, device: Ticket) -> Task {
    Task::new(Stage::StageIn.label(), move |ctx| {
        let host = stages.pools.host_in.enter(&host);
        let device = stages.pools.dev_in.enter(&device);
        let started = Instant::now();
        let result = stages.device.stage_in(ctx, &host, &device, items);
        stages.record(Stage::StageIn, started, &result);
        result
    })
}

fn invoke_task(stages: Arc<StageSet>, items: usize, input: Ticket, output: Ticket) -> Task {
    Task::new(Stage::Invoke.label(), move |ctx| {
        let input = stages.pools.dev_in.enter(&input);
        let output = stages.pools.dev_out.enter(&output);
        let started = Instant::now();
        let result = stages.device.invoke(ctx, &input, &output, items);
        stages.record(Stage::Invoke, started, &result);
        result
    })
}

fn stage_out_task(stages: Arc<StageSet>, items: usize, device: Ticket, host: Ticket) -> Task {
    Task::new(Stage::StageOut.label(), move |ctx| {
        let device = stages.pools.dev_out.enter(&device);
        let host = stages.pools.host_out.enter(&host);
        let started = Instant::now();
        let result = stages.device.stage_out(ctx, &device, &host, items);
        stages.record(Stage::StageOut, started, &result);
        result
    })
}

/// Statuses an extraction checks before reading its slot.
struct Upstream {
    prepare: CompletionHandle,
    stage_in: CompletionHandle,
    invoke: CompletionHandle,
    stage_out: CompletionHandle,
}

impl Upstream {
    fn first_failure(&self) -> Option<String> {
        [
            (Stage::Prepare, &self.prepare),
            (Stage::StageIn, &self.stage_in),
            (Stage::Invoke, &self.invoke),
            (Stage::StageOut, &self.stage_out),
        ]
        .into_iter()
        .find_map(|(stage, handle)| match handle.peek() {
            Some(TaskStatus::Failed { code, message }) => Some(format!(
                "{} failed with code {code}: {message}",
                stage.label()
            )),
            _ => None,
        })
    }
}

fn extract_task(
    stages: Arc<StageSet>,
    item: Arc<BatchItem>,
    slot: usize,
    ticket: Ticket,
    upstream: Upstream,
) -> Task {
    Task::new(Stage::Extract.label(), move |_ctx| {
        let buffer = stages.pools.host_out.enter(&ticket);
        let started = Instant::now();

        let result = match upstream.first_failure() {
            Some(reason) => {
                item.set_outcome(ItemOutcome::Failed(reason));
                Ok(())
            }
            None => {
                let result = extract_slot(stages.postprocessor.as_ref(), &buffer, &item, slot);
                item.set_outcome(match &result {
                    Ok(()) => ItemOutcome::Succeeded,
                    Err(err) => ItemOutcome::Failed(err.to_string()),
                });
                stages.record(Stage::Extract, started, &result);
                result
            }
        };
        drop(buffer);

        stages.metrics.items_extracted.fetch_add(1, Ordering::Relaxed);
        if matches!(item.outcome(), ItemOutcome::Failed(_)) {
            stages.metrics.items_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    })
}

fn deliver_task(stages: Arc<StageSet>, outgoing: Vec<Outgoing>) -> Task {
    Task::new(Stage::Deliver.label(), move |_ctx| {
        let started = Instant::now();
        for Outgoing { item, done } in outgoing {
            stages.deliver(&item);
            drop(done);
        }
        stages.metrics.record_stage(Stage::Deliver, started);
        Ok(())
    })
}

fn extract_slot(
    postprocessor: &dyn Postprocessor,
    buffer: &BatchBuffer,
    item: &BatchItem,
    slot: usize,
) -> Result<()> {
    let view = buffer.view(slot)?;
    postprocessor.extract(&view.tensors(), slot, item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, RawCopyPreprocessor, ScorePostprocessor};
    use batchline_core::stage_traits::TracingEvents;
    use batchline_core::types::{Frame, FrameDescriptor, PixelFormat};
    use batchline_core::worker::WorkerPoolConfig;
    use std::time::Duration;

    fn admission(batch_size: usize) -> Admission {
        let device = LoopbackDevice::new(4);
        let shape = device.model_shape();
        let stages = Arc::new(StageSet {
            device: Arc::new(device),
            preprocessor: Arc::new(RawCopyPreprocessor),
            postprocessor: Arc::new(ScorePostprocessor::new()),
            delivery: None,
            pools: BufferPools::new(batch_size, &shape),
            metrics: PipelineMetrics::new(),
        });
        let workers = WorkerPool::init(
            WorkerPoolConfig {
                device_id: 0,
                threads: 4,
                capacity: 64,
            },
            Arc::new(TracingEvents),
        )
        .expect("pool");
        Admission::new(stages, Arc::new(workers), batch_size)
    }

    fn item(frame_id: u64) -> Arc<BatchItem> {
        let frame = Frame::new(
            "cam-0",
            frame_id,
            FrameDescriptor::packed(2, 2, PixelFormat::Rgba32),
            vec![frame_id as u8; 16],
        );
        Arc::new(BatchItem::frame(Arc::new(frame)))
    }

    #[test]
    fn interval_infers_every_nth_frame() {
        let mut admission = admission(1);
        let picks: Vec<bool> = (0..6).map(|_| admission.next_frame_inferred(3)).collect();
        assert_eq!(picks, vec![true, false, false, true, false, false]);
        assert!(admission.next_frame_inferred(0));
        assert!(admission.next_frame_inferred(1));
    }

    #[test]
    fn full_batch_seals_immediately() {
        let mut admission = admission(2);
        let done = Completion::new();
        let guard = DoneGuard::new(done.clone());
        admission.admit(item(1), guard.clone()).expect("admit");
        assert_eq!(admission.pending(), 1);
        admission.admit(item(2), guard).expect("admit");
        assert!(admission.is_empty());
        assert!(done.wait_timeout(Duration::from_secs(5)).is_some());
        assert_eq!(admission.stages.metrics.snapshot().batches_sealed, 1);
    }

    #[test]
    fn sealing_an_empty_batch_is_a_no_op() {
        let mut admission = admission(4);
        admission.seal(SealTrigger::Flush).expect("empty seal");
        assert_eq!(admission.stages.metrics.snapshot().batches_sealed, 0);
    }

    #[test]
    fn partial_batch_releases_its_reservation_on_seal() {
        let mut admission = admission(4);
        let done = Completion::new();
        admission
            .admit(item(1), DoneGuard::new(done.clone()))
            .expect("admit");
        admission.seal(SealTrigger::Timeout).expect("seal");
        assert!(done.wait_timeout(Duration::from_secs(5)).is_some());

        let snap = admission.stages.metrics.snapshot();
        assert_eq!(snap.batches_sealed_by_timeout, 1);
        assert_eq!(admission.stages.pools.host_in.queue().pending_turns(), 0);
        assert_eq!(admission.stages.pools.host_out.queue().pending_turns(), 0);
    }

    #[test]
    fn failed_admit_gives_back_its_host_in_claim() {
        let mut admission = admission(4);
        admission.workers.shutdown();
        let done = Completion::new();
        let err = admission
            .admit(item(1), DoneGuard::new(done.clone()))
            .expect_err("pool is shut down");
        assert!(matches!(err, EngineError::Shutdown));
        assert!(admission.is_empty());
        assert!(done.is_set());

        // Only the open batch's reservation is left; sealing drops it.
        admission.seal(SealTrigger::Flush).expect("empty seal");
        assert_eq!(admission.stages.pools.host_in.queue().pending_turns(), 0);
    }

    #[test]
    fn skip_without_open_batch_delivers_right_away() {
        let mut admission = admission(4);
        let done = Completion::new();
        admission
            .skip(item(1), DoneGuard::new(done.clone()))
            .expect("skip");
        assert!(done.wait_timeout(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn skip_behind_open_batch_waits_for_its_seal() {
        let mut admission = admission(4);
        let admitted = Completion::new();
        let skipped = Completion::new();
        admission
            .admit(item(1), DoneGuard::new(admitted.clone()))
            .expect("admit");
        admission
            .skip(item(2), DoneGuard::new(skipped.clone()))
            .expect("skip");
        assert!(skipped.wait_timeout(Duration::from_millis(50)).is_none());

        admission.seal(SealTrigger::Flush).expect("seal");
        assert!(skipped.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(admitted.is_set());
    }

    #[test]
    fn dropped_admission_releases_open_handles() {
        let mut admission = admission(4);
        let done = Completion::new();
        admission
            .admit(item(1), DoneGuard::new(done.clone()))
            .expect("admit");
        drop(admission);
        assert!(done.wait_timeout(Duration::from_secs(5)).is_some());
    }
}
