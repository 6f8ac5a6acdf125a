//! Ticket Queue: ordered turns for one shared resource.
//!
//! # Turns and claims
//!
//! The queue is a FIFO of *turns*. The front turn is active; every other turn
//! waits. A turn stays at the front until all of its *claims* are completed.
//! Taking a ticket registers one claim, and every holder of that ticket
//! completes exactly one claim through [`TicketQueue::complete_turn`].
//!
//! # Reservation
//!
//! Taking a ticket with `reserve = true` registers one extra claim up front,
//! so that the *next* pick-up re-enters the same turn instead of queueing a
//! new one. This lets the per-item stages of one batch share a resource while
//! the next batch queues behind the whole group.
//!
//! Two forms are offered:
//!
//! - [`TicketQueue::take_ticket`] / [`TicketQueue::take_ticket_discarding_reservation`]
//!   keep the reservation inside the queue. Callers must be serialized.
//! - [`TicketQueue::take`] returns the reservation as an explicit [`Lease`]
//!   that is handed to the next `take` to re-enter the turn. A lease that is
//!   dropped unused releases its claim, so a chain that ends early (for
//!   example a batch sealed by timeout) never strands the turn.
//!
//! # Contract
//!
//! Taking a ticket never blocks. A ticket taken while the queue is empty is
//! active before `take` returns. Failing to complete a claim deadlocks every
//! later ticket; completing a turn that has no outstanding claim panics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::signal::Completion;

// ─── Ticket ──────────────────────────────────────────────────────────────────

/// Read-only "my turn has arrived" signal.
#[derive(Clone, Debug)]
pub struct Ticket {
    serial: u64,
    active: Completion<()>,
}

impl Ticket {
    /// Issuance number of the turn this ticket belongs to.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_active(&self) -> bool {
        self.active.is_set()
    }

    /// Block until this ticket's turn is active.
    pub fn wait(&self) {
        self.active.wait();
    }

    /// Block for at most `timeout`; returns whether the turn became active.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.active.wait_timeout(timeout).is_some()
    }
}

// ─── Queue state ─────────────────────────────────────────────────────────────

struct Turn {
    serial: u64,
    claims: usize,
    active: Completion<()>,
}

#[derive(Default)]
struct QueueState {
    turns: VecDeque<Turn>,
    next_serial: u64,
    /// Turn reserved through the stateful `take_ticket` API.
    reserved: Option<u64>,
    retired: u64,
}

impl QueueState {
    fn open_turn(&mut self) -> Ticket {
        let serial = self.next_serial;
        self.next_serial += 1;
        let active = Completion::new();
        if self.turns.is_empty() {
            active.set(());
        }
        self.turns.push_back(Turn {
            serial,
            claims: 1,
            active: active.clone(),
        });
        Ticket { serial, active }
    }

    fn turn_mut(&mut self, serial: u64) -> &mut Turn {
        let front = self.turns.front().map(|turn| turn.serial).unwrap_or(serial);
        let index = serial.checked_sub(front).map(|offset| offset as usize);
        match index.and_then(|index| self.turns.get_mut(index)) {
            Some(turn) => turn,
            None => panic!("ticket queue has no live turn {serial}"),
        }
    }

    fn ticket_for(&mut self, serial: u64) -> Ticket {
        let turn = self.turn_mut(serial);
        Ticket {
            serial,
            active: turn.active.clone(),
        }
    }

    fn add_claim(&mut self, serial: u64) {
        self.turn_mut(serial).claims += 1;
    }

    fn release_claim(&mut self, serial: u64) {
        let turn = self.turn_mut(serial);
        if turn.claims == 0 {
            panic!("ticket queue turn {serial} completed more times than it was claimed");
        }
        turn.claims -= 1;
        self.advance();
    }

    /// Retire drained turns at the front and activate the new front.
    fn advance(&mut self) {
        let mut retired_any = false;
        while self.turns.front().is_some_and(|turn| turn.claims == 0) {
            self.turns.pop_front();
            self.retired += 1;
            retired_any = true;
        }
        if retired_any && let Some(front) = self.turns.front() {
            front.active.set(());
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Lease ───────────────────────────────────────────────────────────────────

/// A reserved claim on a turn, consumed by the next [`TicketQueue::take`].
///
/// Dropping a lease without passing it on releases the claim.
pub struct Lease {
    state: Arc<Mutex<QueueState>>,
    serial: u64,
    armed: bool,
}

impl Lease {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn consume(mut self) -> u64 {
        self.armed = false;
        self.serial
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("serial", &self.serial)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.state).release_claim(self.serial);
        }
    }
}

/// Result of [`TicketQueue::take`].
#[derive(Debug)]
pub struct Claim {
    pub ticket: Ticket,
    /// Present when the ticket was taken with `reserve = true`.
    pub lease: Option<Lease>,
}

// ─── Queue ───────────────────────────────────────────────────────────────────

/// FIFO arbitration for one shared resource.
#[derive(Default)]
pub struct TicketQueue {
    state: Arc<Mutex<QueueState>>,
}

impl TicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a ticket, re-entering the reserved turn if the previous call
    /// reserved one.
    pub fn take_ticket(&self, reserve: bool) -> Ticket {
        let mut state = lock(&self.state);
        let ticket = match state.reserved.take() {
            Some(serial) => state.ticket_for(serial),
            None => state.open_turn(),
        };
        if reserve {
            state.add_claim(ticket.serial);
            state.reserved = Some(ticket.serial);
        }
        ticket
    }

    /// Release any reserved turn, then take a ticket on a new turn.
    pub fn take_ticket_discarding_reservation(&self, reserve: bool) -> Ticket {
        let mut state = lock(&self.state);
        if let Some(serial) = state.reserved.take() {
            state.release_claim(serial);
        }
        let ticket = state.open_turn();
        if reserve {
            state.add_claim(ticket.serial);
            state.reserved = Some(ticket.serial);
        }
        ticket
    }

    /// Take a ticket, re-entering the turn held by `lease` when one is given.
    ///
    /// # Panics
    ///
    /// Panics if `lease` was issued by a different queue.
    pub fn take(&self, lease: Option<Lease>, reserve: bool) -> Claim {
        let mut state = lock(&self.state);
        let ticket = match lease {
            Some(lease) => {
                if !Arc::ptr_eq(&lease.state, &self.state) {
                    panic!("lease for turn {} belongs to another ticket queue", lease.serial);
                }
                let serial = lease.consume();
                state.ticket_for(serial)
            }
            None => state.open_turn(),
        };
        let lease = if reserve {
            state.add_claim(ticket.serial);
            Some(Lease {
                state: self.state.clone(),
                serial: ticket.serial,
                armed: true,
            })
        } else {
            None
        };
        Claim { ticket, lease }
    }

    /// Block until `ticket` is active.
    pub fn wait(&self, ticket: &Ticket) {
        ticket.wait();
    }

    /// Complete one claim on the active turn.
    ///
    /// # Panics
    ///
    /// Panics when the queue is empty.
    pub fn complete_turn(&self) {
        let mut state = lock(&self.state);
        let Some(serial) = state.turns.front().map(|turn| turn.serial) else {
            panic!("complete_turn called on an empty ticket queue");
        };
        state.release_claim(serial);
    }

    /// Complete the claim held by `ticket` whether or not its turn is active.
    ///
    /// For a holder that will never enter its turn, such as a task that was
    /// dropped before it ran. The turn retires once it reaches the front with
    /// no claims left.
    pub fn abandon(&self, ticket: &Ticket) {
        let mut state = lock(&self.state);
        state.release_claim(ticket.serial);
    }

    /// Serial of the active turn, if any.
    pub fn active_serial(&self) -> Option<u64> {
        lock(&self.state).turns.front().map(|turn| turn.serial)
    }

    /// Number of turns queued, the active one included.
    pub fn pending_turns(&self) -> usize {
        lock(&self.state).turns.len()
    }

    /// Number of turns fully served since construction.
    pub fn retired_turns(&self) -> u64 {
        lock(&self.state).retired
    }
}

impl std::fmt::Debug for TicketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("TicketQueue")
            .field("pending", &state.turns.len())
            .field("active", &state.turns.front().map(|turn| turn.serial))
            .field("retired", &state.retired)
            .finish()
    }
}
