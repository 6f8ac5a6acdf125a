//! One-shot, multi-reader completion signal.
//!
//! A [`Completion`] is set exactly once and read any number of times by any
//! number of waiters. Cloning a `Completion` yields another handle to the same
//! signal. Task Nodes publish their status through one; Ticket Queue turns use
//! `Completion<()>` as the "your turn has arrived" flag.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// Shareable one-shot signal carrying a value of type `T`.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("set", &self.is_set())
            .finish()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Publish `value` and wake every waiter.
    ///
    /// Returns `false` (and drops `value`) if the signal was already set; the
    /// first value is the one every reader observes.
    pub fn set(&self, value: T) -> bool {
        let mut guard = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.slot.ready.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether both handles refer to the same signal.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Clone> Completion<T> {
    /// Block until the signal is set and return its value.
    pub fn wait(&self) -> T {
        let guard = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .slot
            .ready
            .wait_while(guard, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(value) => value.clone(),
            None => unreachable!("wait_while returned with an unset completion"),
        }
    }

    /// Block for at most `timeout`; `None` if the signal is still unset.
    ///
    /// A timeout too large to express as a deadline waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut guard = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = guard.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .slot
                .ready
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Current value without blocking.
    pub fn peek(&self) -> Option<T> {
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
