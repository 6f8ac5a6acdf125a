//! Inference device contract: the hardware side of the stage chain.

use crate::error::{EngineError, Result};
use crate::resource::BatchBuffer;
use crate::worker::WorkerContext;

/// Per-item tensor sizes of a loaded model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelShape {
    /// Bytes of one batch slot, per input tensor.
    pub input_bytes: Vec<usize>,
    /// Bytes of one batch slot, per output tensor.
    pub output_bytes: Vec<usize>,
}

impl ModelShape {
    pub fn validate(&self) -> Result<()> {
        if self.input_bytes.is_empty() || self.output_bytes.is_empty() {
            return Err(EngineError::DimensionMismatch(
                "model shape needs at least one input and one output tensor".into(),
            ));
        }
        if self.input_bytes.contains(&0) || self.output_bytes.contains(&0) {
            return Err(EngineError::DimensionMismatch(format!(
                "model shape has an empty tensor: inputs {:?}, outputs {:?}",
                self.input_bytes, self.output_bytes
            )));
        }
        Ok(())
    }
}

/// Device-side transfers and network invocation.
///
/// Every call is synchronous from the scheduler's point of view and runs
/// inside a Task Node body. `items` is the number of filled batch positions;
/// positions past it hold stale data. `ctx` identifies the executing worker
/// so implementations can look up per-worker device handles explicitly.
pub trait InferenceDevice: Send + Sync {
    fn name(&self) -> &str;

    fn model_shape(&self) -> ModelShape;

    /// Host input → device input.
    fn stage_in(
        &self,
        ctx: &WorkerContext,
        host: &BatchBuffer,
        device: &BatchBuffer,
        items: usize,
    ) -> Result<()>;

    /// Run the network over the first `items` positions.
    fn invoke(
        &self,
        ctx: &WorkerContext,
        input: &BatchBuffer,
        output: &BatchBuffer,
        items: usize,
    ) -> Result<()>;

    /// Device output → host output.
    fn stage_out(
        &self,
        ctx: &WorkerContext,
        device: &BatchBuffer,
        host: &BatchBuffer,
        items: usize,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_requires_tensors() {
        let shape = ModelShape {
            input_bytes: vec![],
            output_bytes: vec![4],
        };
        let err = shape.validate().expect_err("empty inputs must fail");
        assert!(err.to_string().contains("at least one input"));
    }

    #[test]
    fn shape_rejects_zero_sized_tensor() {
        let shape = ModelShape {
            input_bytes: vec![16, 0],
            output_bytes: vec![4],
        };
        let err = shape.validate().expect_err("zero-sized tensor must fail");
        assert!(err.to_string().contains("empty tensor"));
    }
}
