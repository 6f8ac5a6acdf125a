//! Collaborator contracts invoked from stage bodies.
//!
//! These traits keep per-model pre/post-processing, transport and
//! observability outside the scheduler. Implementations are chosen at engine
//! construction and shared as trait objects across workers.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use crate::backend::ModelShape;
use crate::error::Result;
use crate::types::{BatchItem, DetectedObject, Frame};

// ─── Processing ──────────────────────────────────────────────────────────

/// Parameters forwarded to processors once the model shape is known.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessorParams {
    pub threshold: f32,
    pub custom: BTreeMap<String, String>,
}

/// Writes one item into its batch slot of the input tensors.
pub trait Preprocessor: Send + Sync {
    /// Called once at engine construction, before any `prepare`.
    fn on_shape_known(&self, _shape: &ModelShape, _params: &ProcessorParams) -> Result<()> {
        Ok(())
    }

    /// Fill `inputs[t]` (the item's slice of input tensor `t`) for batch
    /// position `slot`.
    fn prepare(&self, item: &BatchItem, slot: usize, inputs: &mut [&mut [u8]]) -> Result<()>;
}

/// Reads one item's slice of the output tensors and attaches results.
pub trait Postprocessor: Send + Sync {
    /// Called once at engine construction, before any `extract`.
    fn on_shape_known(&self, _shape: &ModelShape, _params: &ProcessorParams) -> Result<()> {
        Ok(())
    }

    fn extract(&self, outputs: &[&[u8]], slot: usize, item: &BatchItem) -> Result<()>;
}

/// Selects which detected objects are inferred in object mode.
pub trait ObjectFilter: Send + Sync {
    fn accept(&self, frame: &Frame, object: &DetectedObject) -> bool;
}

// ─── Delivery ────────────────────────────────────────────────────────────

/// Hands a finished item to the downstream collaborator.
///
/// Called from the item's extraction task, whatever its outcome.
pub trait Delivery: Send + Sync {
    fn deliver(&self, item: &BatchItem);
}

// ─── Events ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Out-of-band report sink, called once per failing stage invocation.
pub trait EventSink: Send + Sync {
    fn report(&self, severity: Severity, message: &str);
}

/// Default sink: forwards reports to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn report(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(%message, "Pipeline event"),
            Severity::Warning => warn!(%message, "Pipeline event"),
            Severity::Error => error!(%message, "Pipeline event"),
        }
    }
}
