//! Quiescence Timer: forces a flush after an idle window.
//!
//! # State machine
//!
//! ```text
//!            arm                 arm
//!   Idle ─────────► Armed ─────────────► Reset ──┐ arm (replace)
//!    ▲  ◄────────── │   ◄──────────────── │  ◄───┘
//!    │   disarm     │    thread re-waits   │
//!    │              │    the full window   │ disarm
//!    └──────────────┘◄─────────────────────┘
//!      window elapsed: run flush, → Idle
//!
//!   any state ── shutdown ──► Exited (arm/disarm become no-ops)
//! ```
//!
//! One background thread is created at construction and joined on drop; it
//! is never recreated per arm.
//!
//! # Shared lock
//!
//! The timer's mutex also guards a caller payload `T` (the open batch).
//! [`QuiescenceTimer::lock`] returns an [`OperatorGuard`] that derefs to the
//! payload and exposes [`arm`](OperatorGuard::arm) /
//! [`disarm`](OperatorGuard::disarm), so "append item" and "re-arm" are one
//! atomic step with respect to the background thread. The flush callback
//! runs on the background thread while holding the same lock and receives
//! `&mut T`.

use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};

/// Forced flushes between two tuning hints in the log.
const FLUSH_HINT_INTERVAL: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// No pending flush.
    Idle,
    /// A flush is registered and the window is counting.
    Armed,
    /// Re-armed while armed; the thread restarts the full window.
    Reset,
    /// Terminal; the background thread has stopped.
    Exited,
}

type Flush<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

struct Inner<T> {
    state: TimerState,
    flush: Option<Flush<T>>,
    window: Duration,
    fired: u64,
    payload: T,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    wake: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Idle-window timer sharing its lock with a payload `T`.
pub struct QuiescenceTimer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> QuiescenceTimer<T> {
    pub fn new(window: Duration, payload: T) -> Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: TimerState::Idle,
                flush: None,
                window,
                fired: 0,
                payload,
            }),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("batchline-quiescence".into())
            .spawn(move || timer_loop(worker))
            .map_err(|err| {
                EngineError::Pipeline(format!("Failed to spawn quiescence timer: {err}"))
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Take the shared lock.
    pub fn lock(&self) -> OperatorGuard<'_, T> {
        OperatorGuard {
            inner: self.shared.lock(),
            wake: &self.shared.wake,
        }
    }

    pub fn state(&self) -> TimerState {
        self.shared.lock().state
    }

    /// Number of flushes fired by the window elapsing.
    pub fn fired(&self) -> u64 {
        self.shared.lock().fired
    }

    /// Move to `Exited` and join the background thread. Idempotent.
    ///
    /// A pending flush is dropped without running.
    pub fn shutdown(&mut self) {
        let pending = {
            let mut inner = self.shared.lock();
            inner.state = TimerState::Exited;
            inner.flush.take()
        };
        self.shared.wake.notify_all();
        drop(pending);

        if let Some(handle) = self.thread.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Quiescence timer thread exited with a panic");
        }
    }
}

impl<T: Send + 'static> Drop for QuiescenceTimer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Send + 'static> std::fmt::Debug for QuiescenceTimer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("QuiescenceTimer")
            .field("state", &inner.state)
            .field("window", &inner.window)
            .field("fired", &inner.fired)
            .finish()
    }
}

// ─── Operator guard ─────────────────────────────────────────────────────────

/// Scoped hold on the timer lock.
pub struct OperatorGuard<'a, T> {
    inner: MutexGuard<'a, Inner<T>>,
    wake: &'a Condvar,
}

impl<T> OperatorGuard<'_, T> {
    /// Register `flush` to run once the window elapses with no further arm.
    pub fn arm<F>(&mut self, flush: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let next = match self.inner.state {
            TimerState::Exited => {
                warn!("Quiescence timer has exited; arm ignored");
                return;
            }
            TimerState::Idle => TimerState::Armed,
            TimerState::Armed | TimerState::Reset => TimerState::Reset,
        };
        self.inner.state = next;
        self.inner.flush = Some(Box::new(flush));
        self.wake.notify_all();
    }

    /// Drop any pending flush.
    pub fn disarm(&mut self) {
        match self.inner.state {
            TimerState::Exited => debug!("Quiescence timer has exited; disarm ignored"),
            TimerState::Idle => {}
            TimerState::Armed | TimerState::Reset => {
                self.inner.state = TimerState::Idle;
                self.inner.flush = None;
                self.wake.notify_all();
            }
        }
    }

    pub fn state(&self) -> TimerState {
        self.inner.state
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }
}

impl<T> Deref for OperatorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.payload
    }
}

impl<T> DerefMut for OperatorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner.payload
    }
}

// ─── Background thread ──────────────────────────────────────────────────────

fn timer_loop<T>(shared: Arc<Shared<T>>) {
    let mut inner = shared.lock();
    loop {
        inner = shared
            .wake
            .wait_while(inner, |inner| inner.state == TimerState::Idle)
            .unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            TimerState::Exited => break,
            TimerState::Reset => inner.state = TimerState::Armed,
            TimerState::Idle | TimerState::Armed => {}
        }

        let window = inner.window;
        let (guard, waited) = shared
            .wake
            .wait_timeout_while(inner, window, |inner| inner.state == TimerState::Armed)
            .unwrap_or_else(PoisonError::into_inner);
        inner = guard;

        match inner.state {
            TimerState::Armed if waited.timed_out() => fire(&mut inner),
            TimerState::Exited => break,
            // Reset restarts the window at the top of the loop; Idle parks.
            TimerState::Armed | TimerState::Reset | TimerState::Idle => {}
        }
    }
    debug!("Quiescence timer exiting");
}

fn fire<T>(inner: &mut Inner<T>) {
    let flush = inner.flush.take();
    inner.fired += 1;
    if let Some(flush) = flush {
        let payload = &mut inner.payload;
        if catch_unwind(AssertUnwindSafe(move || flush(payload))).is_err() {
            error!("Quiescence flush callback panicked");
        }
    }
    inner.state = TimerState::Idle;

    if inner.fired % FLUSH_HINT_INTERVAL == 0 {
        info!(
            fired = inner.fired,
            window_ms = inner.window.as_millis() as u64,
            "Batching timeout fired repeatedly; a longer timeout or a smaller batch size reduces forced flushes"
        );
    }
}
