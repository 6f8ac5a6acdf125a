//! Bounded Worker Pool executing Task Nodes.
//!
//! # Architecture
//!
//! ```text
//!  submit ──► ┌──────────────────────────┐ ──► worker 0 ──► Task::run
//!  (blocks    │ VecDeque<Task>           │ ──► worker 1 ──► Task::run
//!   when full)│ capacity = N             │ ──► ...
//!             └──────────────────────────┘
//! ```
//!
//! Executors pop in FIFO order. Because every ticket and dependency a task
//! waits on belongs to an earlier-submitted task, the oldest unfinished task
//! is always runnable and the pool cannot wedge itself as long as it has at
//! least one thread.
//!
//! # Per-worker context
//!
//! Each executor is bound to one [`WorkerContext`] created at
//! [`WorkerPool::init`] and passed to every task body it runs. Collaborators
//! that keep per-thread device handles key them by `WorkerContext::worker`.
//!
//! # Shutdown contract
//!
//! [`WorkerPool::shutdown`] stops intake, drops every task still queued
//! without running it and joins the executors. A caller waiting on the
//! completion of a dropped task never wakes: flush and collect outstanding
//! work **before** shutting down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::stage_traits::{EventSink, Severity};
use crate::task::{Task, TaskStatus};

/// Identity of the executor running a task body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    /// Index of the executor thread, `0..threads`.
    pub worker: usize,
    /// Device ordinal the pool was initialised for.
    pub device_id: u32,
}

/// Pool sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub device_id: u32,
    pub threads: usize,
    pub capacity: usize,
}

/// Atomic counters for pool activity.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

struct Intake {
    tasks: VecDeque<Task>,
    running: bool,
}

struct Shared {
    intake: Mutex<Intake>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    events: Arc<dyn EventSink>,
    stats: PoolStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Intake> {
        self.intake.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of executor threads pulling from a bounded queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    contexts: Vec<WorkerContext>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.threads` executors. Zero threads is accepted and yields
    /// a pool that queues without executing.
    pub fn init(config: WorkerPoolConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        if config.capacity == 0 {
            return Err(EngineError::Config(
                "WorkerPool: queue capacity must be >= 1".into(),
            ));
        }

        let shared = Arc::new(Shared {
            intake: Mutex::new(Intake {
                tasks: VecDeque::new(),
                running: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: config.capacity,
            events,
            stats: PoolStats::default(),
        });

        let contexts: Vec<WorkerContext> = (0..config.threads)
            .map(|worker| WorkerContext {
                worker,
                device_id: config.device_id,
            })
            .collect();

        let pool = Self {
            shared,
            contexts,
            handles: Mutex::new(Vec::with_capacity(config.threads)),
        };

        for ctx in pool.contexts.iter().copied() {
            let shared = pool.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("batchline-worker-{}", ctx.worker))
                .spawn(move || executor_loop(shared, ctx));
            match spawned {
                Ok(handle) => pool.lock_handles().push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(EngineError::Pipeline(format!(
                        "Failed to spawn worker {}: {err}",
                        ctx.worker
                    )));
                }
            }
        }

        info!(
            threads = config.threads,
            capacity = config.capacity,
            device_id = config.device_id,
            "Worker pool started"
        );
        Ok(pool)
    }

    /// Enqueue `task`, blocking while the queue is full.
    ///
    /// Returns [`EngineError::Shutdown`] once shutdown has begun; the task is
    /// dropped without running.
    pub fn submit(&self, task: Task) -> Result<()> {
        let intake = self.shared.lock();
        let mut intake = self
            .shared
            .not_full
            .wait_while(intake, |intake| {
                intake.running && intake.tasks.len() >= self.shared.capacity
            })
            .unwrap_or_else(PoisonError::into_inner);
        self.push_locked(&mut intake, task)
    }

    /// As [`submit`](Self::submit), giving up after `timeout` of backpressure.
    pub fn submit_timeout(&self, task: Task, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let intake = self.shared.lock();
        let (mut intake, waited) = self
            .shared
            .not_full
            .wait_timeout_while(intake, timeout, |intake| {
                intake.running && intake.tasks.len() >= self.shared.capacity
            })
            .unwrap_or_else(PoisonError::into_inner);
        if waited.timed_out() && intake.running && intake.tasks.len() >= self.shared.capacity {
            return Err(EngineError::BackpressureTimeout {
                stage: task.stage(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
        self.push_locked(&mut intake, task)
    }

    /// Submit every task in order.
    pub fn submit_all<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        for task in tasks {
            self.submit(task)?;
        }
        Ok(())
    }

    fn push_locked(&self, intake: &mut Intake, task: Task) -> Result<()> {
        if !intake.running {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::Shutdown);
        }
        debug!(stage = task.stage(), queued = intake.tasks.len(), "Task submitted");
        intake.tasks.push_back(task);
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Context bound to executor `worker`.
    pub fn context(&self, worker: usize) -> Option<&WorkerContext> {
        self.contexts.get(worker)
    }

    pub fn threads(&self) -> usize {
        self.contexts.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Stop intake, drop queued tasks and join every executor. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut intake = self.shared.lock();
            intake.running = false;
            std::mem::take(&mut intake.tasks)
        };
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "Worker pool shut down with queued tasks");
            self.shared
                .stats
                .dropped
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        }
        drop(dropped);

        let handles = std::mem::take(&mut *self.lock_handles());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread exited with a panic");
            }
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.contexts.len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

fn executor_loop(shared: Arc<Shared>, ctx: WorkerContext) {
    loop {
        let task = {
            let intake = shared.lock();
            let mut intake = shared
                .not_empty
                .wait_while(intake, |intake| intake.running && intake.tasks.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
            if !intake.running {
                break;
            }
            let Some(task) = intake.tasks.pop_front() else {
                continue;
            };
            shared.not_full.notify_one();
            task
        };

        let stage = task.stage();
        match task.run(&ctx) {
            TaskStatus::Succeeded => {
                shared.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::Failed { code, message } => {
                shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = ctx.worker, stage, code, %message, "Task failed");
                shared.events.report(
                    Severity::Error,
                    &format!("{stage} failed with code {code}: {message}"),
                );
            }
        }
    }
    debug!(worker = ctx.worker, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage_traits::TracingEvents;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingEvents {
        reports: Mutex<Vec<(Severity, String)>>,
    }

    impl EventSink for CountingEvents {
        fn report(&self, severity: Severity, message: &str) {
            self.reports
                .lock()
                .expect("reports lock")
                .push((severity, message.to_string()));
        }
    }

    fn config(threads: usize, capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            device_id: 3,
            threads,
            capacity,
        }
    }

    #[test]
    fn zero_threads_is_accepted() {
        let pool = WorkerPool::init(config(0, 4), Arc::new(TracingEvents)).expect("pool");
        assert_eq!(pool.threads(), 0);
        pool.submit(Task::new("prepare", |_| Ok(()))).expect("queue accepts");
        assert_eq!(pool.queued(), 1);
        pool.shutdown();
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = WorkerPool::init(config(1, 0), Arc::new(TracingEvents))
            .expect_err("capacity 0 must fail");
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn huge_capacity_is_not_preallocated() {
        let pool =
            WorkerPool::init(config(1, usize::MAX), Arc::new(TracingEvents)).expect("pool");
        assert_eq!(pool.capacity(), usize::MAX);
        pool.submit(Task::new("prepare", |_| Ok(()))).expect("queue accepts");
        pool.shutdown();
    }

    #[test]
    fn contexts_are_keyed_by_worker_index() {
        let pool = WorkerPool::init(config(3, 8), Arc::new(TracingEvents)).expect("pool");
        assert_eq!(
            pool.context(2),
            Some(&WorkerContext {
                worker: 2,
                device_id: 3
            })
        );
        assert!(pool.context(3).is_none());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let seen = seen.clone();
                let task = Task::new("prepare", move |ctx| {
                    seen.lock().expect("seen lock").push(*ctx);
                    Ok(())
                });
                let handle = task.completion();
                pool.submit(task).expect("submit");
                handle
            })
            .collect();
        for handle in handles {
            handle.wait();
        }
        for ctx in seen.lock().expect("seen lock").iter() {
            assert!(ctx.worker < 3);
            assert_eq!(ctx.device_id, 3);
        }
    }

    #[test]
    fn single_worker_runs_tasks_in_fifo_order() {
        let pool = WorkerPool::init(config(1, 64), Arc::new(TracingEvents)).expect("pool");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..32 {
            let order = order.clone();
            let task = Task::new("extract", move |_| {
                order.lock().expect("order lock").push(i);
                Ok(())
            });
            last = Some(task.completion());
            pool.submit(task).expect("submit");
        }
        last.expect("last handle").wait();
        assert_eq!(*order.lock().expect("order lock"), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn failures_are_reported_once_each() {
        let events = Arc::new(CountingEvents::default());
        let pool = WorkerPool::init(config(2, 8), events.clone()).expect("pool");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let task = Task::new("invoke", move |_| {
                    if i % 2 == 0 {
                        Err(EngineError::Device(format!("fault {i}")))
                    } else {
                        Ok(())
                    }
                });
                let handle = task.completion();
                pool.submit(task).expect("submit");
                handle
            })
            .collect();
        for handle in &handles {
            handle.wait();
        }
        pool.shutdown();
        let reports = events.reports.lock().expect("reports lock");
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(severity, _)| *severity == Severity::Error));
        assert_eq!(pool.stats().failed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::init(config(1, 2), Arc::new(TracingEvents)).expect("pool");
        pool.shutdown();
        let err = pool
            .submit(Task::new("prepare", |_| Ok(())))
            .expect_err("submit after shutdown must fail");
        match err {
            EngineError::Shutdown => {}
            other => panic!("unexpected error variant: {other:?}"),
        }
        pool.shutdown();
    }

    #[test]
    fn full_queue_applies_backpressure() {
        let pool = WorkerPool::init(config(0, 1), Arc::new(TracingEvents)).expect("pool");
        pool.submit(Task::new("prepare", |_| Ok(()))).expect("first fits");
        let err = pool
            .submit_timeout(Task::new("prepare", |_| Ok(())), Duration::from_millis(20))
            .expect_err("second must time out");
        match err {
            EngineError::BackpressureTimeout { stage, elapsed_ms } => {
                assert_eq!(stage, "prepare");
                assert!(elapsed_ms >= 20);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn blocked_submitter_wakes_when_space_frees() {
        let pool = Arc::new(WorkerPool::init(config(1, 1), Arc::new(TracingEvents)).expect("pool"));
        let gate = Arc::new(crate::signal::Completion::<()>::new());
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let gate = gate.clone();
            let ran = ran.clone();
            let pool = pool.clone();
            // The first task occupies the worker, the second fills the queue,
            // the third blocks in submit until the gate opens.
            thread::spawn(move || {
                pool.submit(Task::new("prepare", move |_| {
                    gate.wait();
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            });
        }
        thread::sleep(Duration::from_millis(30));
        assert!(ran.load(Ordering::SeqCst) == 0);
        gate.set(());
        let start = Instant::now();
        while ran.load(Ordering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5), "tasks never drained");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
