//! Resource Pools: one reusable resource guarded by a [`TicketQueue`].
//!
//! # Exclusivity
//!
//! A resource is only touched between waiting on a ticket and completing the
//! turn. [`ResourcePool::enter`] packages both ends: it blocks until the
//! ticket is active and returns a [`TurnGuard`] that derefs to the resource
//! and completes one claim when dropped (including during unwinding, so a
//! panicking stage body never strands the queue).
//!
//! Holders of the *same* turn (the per-item stages of one batch) may run
//! concurrently. They address disjoint slots of a [`BatchBuffer`], each slot
//! behind its own mutex.

use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::ticket::{Claim, Lease, Ticket, TicketQueue};

// ─── Pool ────────────────────────────────────────────────────────────────────

/// One resource plus the queue arbitrating access to it.
pub struct ResourcePool<R> {
    name: &'static str,
    value: R,
    queue: TicketQueue,
}

impl<R: Send + Sync> ResourcePool<R> {
    pub fn new(name: &'static str, value: R) -> Self {
        Self {
            name,
            value,
            queue: TicketQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Issue a ticket through the queue's internal reservation.
    pub fn acquire_for_write(&self, reserve: bool) -> Ticket {
        self.queue.take_ticket(reserve)
    }

    /// Issue a ticket, re-entering the turn held by `lease` when given.
    pub fn acquire(&self, lease: Option<Lease>, reserve: bool) -> Claim {
        self.queue.take(lease, reserve)
    }

    /// Block until `ticket` is active and expose the resource.
    ///
    /// The caller must call [`release`](Self::release) when done.
    pub fn wait(&self, ticket: &Ticket) -> &R {
        ticket.wait();
        &self.value
    }

    /// Complete one claim on the active turn.
    pub fn release(&self) {
        self.queue.complete_turn();
    }

    /// Give up `ticket` without entering its turn.
    pub fn abandon(&self, ticket: &Ticket) {
        self.queue.abandon(ticket);
    }

    /// Block until `ticket` is active; the guard releases on drop.
    pub fn enter(&self, ticket: &Ticket) -> TurnGuard<'_, R> {
        ticket.wait();
        debug!(pool = self.name, serial = ticket.serial(), "Turn entered");
        TurnGuard { pool: self }
    }

    pub fn queue(&self) -> &TicketQueue {
        &self.queue
    }
}

impl<R> std::fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Scoped access to a pooled resource for the duration of one claim.
pub struct TurnGuard<'a, R> {
    pool: &'a ResourcePool<R>,
}

impl<R> Deref for TurnGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.pool.value
    }
}

impl<R> Drop for TurnGuard<'_, R> {
    fn drop(&mut self) {
        self.pool.queue.complete_turn();
    }
}

// ─── Batch buffer ────────────────────────────────────────────────────────────

/// Batch-indexed tensor storage: one byte slot per (tensor, batch position).
pub struct BatchBuffer {
    label: &'static str,
    slot_bytes: Vec<usize>,
    /// `slots[tensor][position]`.
    slots: Vec<Vec<Mutex<Vec<u8>>>>,
}

/// Locked view of one batch position across every tensor.
pub struct SlotView<'a> {
    guards: Vec<MutexGuard<'a, Vec<u8>>>,
}

impl std::fmt::Debug for SlotView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes: Vec<usize> = self.guards.iter().map(|guard| guard.len()).collect();
        f.debug_struct("SlotView").field("tensor_bytes", &bytes).finish()
    }
}

impl SlotView<'_> {
    pub fn tensors(&self) -> Vec<&[u8]> {
        self.guards.iter().map(|guard| guard.as_slice()).collect()
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut [u8]> {
        self.guards
            .iter_mut()
            .map(|guard| guard.as_mut_slice())
            .collect()
    }
}

impl BatchBuffer {
    /// Allocate `batch_size` zeroed slots for every tensor in `slot_bytes`.
    pub fn new(label: &'static str, batch_size: usize, slot_bytes: &[usize]) -> Self {
        let slots = slot_bytes
            .iter()
            .map(|&bytes| (0..batch_size).map(|_| Mutex::new(vec![0u8; bytes])).collect())
            .collect();
        debug!(
            label,
            batch_size,
            tensors = slot_bytes.len(),
            bytes = slot_bytes.iter().sum::<usize>() * batch_size,
            "Batch buffer allocated"
        );
        Self {
            label,
            slot_bytes: slot_bytes.to_vec(),
            slots,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn batch_size(&self) -> usize {
        self.slots.first().map(Vec::len).unwrap_or(0)
    }

    pub fn tensor_count(&self) -> usize {
        self.slot_bytes.len()
    }

    /// Per-item byte size of tensor `tensor`.
    pub fn slot_bytes(&self, tensor: usize) -> Option<usize> {
        self.slot_bytes.get(tensor).copied()
    }

    /// Lock the slot of one tensor at batch position `slot`.
    pub fn slot(&self, tensor: usize, slot: usize) -> Result<MutexGuard<'_, Vec<u8>>> {
        let Some(column) = self.slots.get(tensor) else {
            return Err(EngineError::DimensionMismatch(format!(
                "{}: tensor {tensor} out of range ({} tensors)",
                self.label,
                self.slots.len()
            )));
        };
        let Some(cell) = column.get(slot) else {
            return Err(EngineError::SlotOutOfRange {
                slot,
                slots: column.len(),
            });
        };
        Ok(cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Lock batch position `slot` across every tensor, in tensor order.
    pub fn view(&self, slot: usize) -> Result<SlotView<'_>> {
        let guards = (0..self.slots.len())
            .map(|tensor| self.slot(tensor, slot))
            .collect::<Result<Vec<_>>>()?;
        Ok(SlotView { guards })
    }

    /// Copy the first `items` slots of every tensor from `source`.
    pub fn copy_from(&self, source: &BatchBuffer, items: usize) -> Result<()> {
        if source.slot_bytes != self.slot_bytes {
            return Err(EngineError::DimensionMismatch(format!(
                "{} -> {}: tensor layouts differ ({:?} vs {:?})",
                source.label, self.label, source.slot_bytes, self.slot_bytes
            )));
        }
        for slot in 0..items {
            let from = source.view(slot)?;
            let mut to = self.view(slot)?;
            for (dst, src) in to.tensors_mut().into_iter().zip(from.tensors()) {
                dst.copy_from_slice(src);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("label", &self.label)
            .field("batch_size", &self.batch_size())
            .field("slot_bytes", &self.slot_bytes)
            .finish()
    }
}
