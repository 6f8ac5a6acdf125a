//! Task Nodes: schedulable units of work with declared upstream dependencies.
//!
//! A [`Task`] owns its body, so the body runs at most once by construction.
//! [`Task::run`] blocks on every upstream [`CompletionHandle`], runs the body
//! with the executing worker's [`WorkerContext`], drops the body (releasing
//! everything it captured), and only then publishes a [`TaskStatus`].
//!
//! Upstream failure does not propagate: a dependent still runs once its
//! dependencies are *done*, whatever their status.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::{EngineError, Result};
use crate::signal::Completion;
use crate::worker::WorkerContext;

/// Body of a Task Node.
pub type TaskBody = Box<dyn FnOnce(&WorkerContext) -> Result<()> + Send + 'static>;

/// Final status published by a Task Node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed { code: u32, message: String },
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// `0` on success, the error's [`EngineError::error_code`] otherwise.
    pub fn code(&self) -> u32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { code, .. } => *code,
        }
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(err) => Self::Failed {
                code: err.error_code(),
                message: err.to_string(),
            },
        }
    }
}

/// Shareable handle to a Task Node's completion signal.
pub type CompletionHandle = Completion<TaskStatus>;

/// One node of the task graph.
pub struct Task {
    stage: &'static str,
    body: TaskBody,
    upstream: Vec<CompletionHandle>,
    done: CompletionHandle,
}

impl Task {
    pub fn new<F>(stage: &'static str, body: F) -> Self
    where
        F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
    {
        Self {
            stage,
            body: Box::new(body),
            upstream: Vec::new(),
            done: Completion::new(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Handle other nodes and the submitter can wait on.
    pub fn completion(&self) -> CompletionHandle {
        self.done.clone()
    }

    /// Wait for `upstream` before running. `None` is accepted and ignored.
    pub fn depends_on(&mut self, upstream: Option<&CompletionHandle>) {
        if let Some(handle) = upstream {
            self.upstream.push(handle.clone());
        }
    }

    pub fn depends_on_all<'a, I>(&mut self, upstream: I)
    where
        I: IntoIterator<Item = &'a CompletionHandle>,
    {
        self.upstream.extend(upstream.into_iter().cloned());
    }

    pub fn upstream_len(&self) -> usize {
        self.upstream.len()
    }

    /// Block on dependencies, execute, release the body, publish the status.
    ///
    /// A panic in the body is caught here and reported as
    /// [`EngineError::PanicRecovered`].
    pub fn run(self, ctx: &WorkerContext) -> TaskStatus {
        let Self {
            stage,
            body,
            upstream,
            done,
        } = self;

        for handle in &upstream {
            handle.wait();
        }
        drop(upstream);

        let result = match catch_unwind(AssertUnwindSafe(move || body(ctx))) {
            Ok(result) => result,
            Err(payload) => Err(EngineError::PanicRecovered {
                stage,
                message: panic_message(payload.as_ref()),
            }),
        };

        let status = TaskStatus::from_result(result);
        done.set(status.clone());
        status
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("stage", &self.stage)
            .field("upstream", &self.upstream.len())
            .field("done", &self.done.is_set())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
