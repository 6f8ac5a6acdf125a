//! Host-memory loopback device and reference processors.
//!
//! The loopback device moves bytes between batch buffers with plain copies
//! and "infers" a two-value summary (mean intensity, byte checksum) per item.
//! It lets the scheduler run end to end without hardware, for the CLI load
//! runner and for tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use batchline_core::backend::{InferenceDevice, ModelShape};
use batchline_core::error::{EngineError, Result};
use batchline_core::resource::BatchBuffer;
use batchline_core::stage_traits::{Postprocessor, Preprocessor, ProcessorParams};
use batchline_core::types::{BatchItem, Inference};
use batchline_core::worker::WorkerContext;

/// Bytes of the per-item summary: two little-endian `f32`.
pub const SUMMARY_BYTES: usize = 8;

// ─── Device ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    input_bytes: usize,
    invoke_delay: Duration,
}

impl LoopbackDevice {
    /// A device whose single input tensor holds `input_bytes` per item.
    pub fn new(input_bytes: usize) -> Self {
        Self {
            input_bytes,
            invoke_delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every `invoke`, to emulate network latency.
    pub fn with_invoke_delay(mut self, delay: Duration) -> Self {
        self.invoke_delay = delay;
        self
    }
}

impl InferenceDevice for LoopbackDevice {
    fn name(&self) -> &str {
        "loopback"
    }

    fn model_shape(&self) -> ModelShape {
        ModelShape {
            input_bytes: vec![self.input_bytes],
            output_bytes: vec![SUMMARY_BYTES],
        }
    }

    fn stage_in(
        &self,
        _ctx: &WorkerContext,
        host: &BatchBuffer,
        device: &BatchBuffer,
        items: usize,
    ) -> Result<()> {
        device.copy_from(host, items)
    }

    fn invoke(
        &self,
        _ctx: &WorkerContext,
        input: &BatchBuffer,
        output: &BatchBuffer,
        items: usize,
    ) -> Result<()> {
        if !self.invoke_delay.is_zero() {
            std::thread::sleep(self.invoke_delay);
        }
        for slot in 0..items {
            let summary = summarize(&input.slot(0, slot)?);
            let mut out = output.slot(0, slot)?;
            if out.len() < SUMMARY_BYTES {
                return Err(EngineError::BufferTooSmall {
                    need: SUMMARY_BYTES,
                    have: out.len(),
                });
            }
            out[..SUMMARY_BYTES].copy_from_slice(&summary);
        }
        Ok(())
    }

    fn stage_out(
        &self,
        _ctx: &WorkerContext,
        device: &BatchBuffer,
        host: &BatchBuffer,
        items: usize,
    ) -> Result<()> {
        host.copy_from(device, items)
    }
}

fn summarize(bytes: &[u8]) -> [u8; SUMMARY_BYTES] {
    let total: u64 = bytes.iter().map(|&b| u64::from(b)).sum();
    let mean = if bytes.is_empty() {
        0.0
    } else {
        total as f32 / bytes.len() as f32 / 255.0
    };
    let checksum = (total % (1 << 24)) as f32;

    let mut out = [0u8; SUMMARY_BYTES];
    out[..4].copy_from_slice(&mean.to_le_bytes());
    out[4..].copy_from_slice(&checksum.to_le_bytes());
    out
}

/// Decode a summary written by [`LoopbackDevice::invoke`].
pub fn decode_summary(bytes: &[u8]) -> Result<(f32, f32)> {
    if bytes.len() < SUMMARY_BYTES {
        return Err(EngineError::BufferTooSmall {
            need: SUMMARY_BYTES,
            have: bytes.len(),
        });
    }
    let mean = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let checksum = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((mean, checksum))
}

// ─── Processors ──────────────────────────────────────────────────────────────

/// Copies the frame's bytes into the item's input slot, zero-padding or
/// truncating to the slot size.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCopyPreprocessor;

impl Preprocessor for RawCopyPreprocessor {
    fn prepare(&self, item: &BatchItem, _slot: usize, inputs: &mut [&mut [u8]]) -> Result<()> {
        let Some(input) = inputs.first_mut() else {
            return Err(EngineError::DimensionMismatch(
                "raw copy needs one input tensor".into(),
            ));
        };
        let data = &item.source().data;
        let n = data.len().min(input.len());
        input[..n].copy_from_slice(&data[..n]);
        input[n..].fill(0);
        Ok(())
    }
}

/// Attaches the loopback summary as an [`Inference`] when its mean clears
/// the configured threshold.
#[derive(Debug, Default)]
pub struct ScorePostprocessor {
    threshold: Mutex<f32>,
}

impl ScorePostprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(&self) -> f32 {
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Postprocessor for ScorePostprocessor {
    fn on_shape_known(&self, shape: &ModelShape, params: &ProcessorParams) -> Result<()> {
        if shape.output_bytes.first().copied().unwrap_or(0) < SUMMARY_BYTES {
            return Err(EngineError::DimensionMismatch(format!(
                "score postprocessor needs {SUMMARY_BYTES} output bytes per item, model has {:?}",
                shape.output_bytes
            )));
        }
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner) = params.threshold;
        Ok(())
    }

    fn extract(&self, outputs: &[&[u8]], _slot: usize, item: &BatchItem) -> Result<()> {
        let Some(output) = outputs.first() else {
            return Err(EngineError::DimensionMismatch(
                "score postprocessor needs one output tensor".into(),
            ));
        };
        let (mean, checksum) = decode_summary(output)?;
        if mean >= self.threshold() {
            item.attach(Inference {
                label: 0,
                score: mean,
                values: vec![mean, checksum],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchline_core::types::{Frame, FrameDescriptor, PixelFormat};
    use std::sync::Arc;

    fn ctx() -> WorkerContext {
        WorkerContext {
            worker: 0,
            device_id: 0,
        }
    }

    #[test]
    fn loopback_chain_produces_mean_and_checksum() {
        let device = LoopbackDevice::new(4);
        let shape = device.model_shape();
        let host_in = BatchBuffer::new("host_in", 2, &shape.input_bytes);
        let dev_in = BatchBuffer::new("dev_in", 2, &shape.input_bytes);
        let dev_out = BatchBuffer::new("dev_out", 2, &shape.output_bytes);
        let host_out = BatchBuffer::new("host_out", 2, &shape.output_bytes);

        host_in.slot(0, 0).expect("slot").copy_from_slice(&[255; 4]);
        host_in.slot(0, 1).expect("slot").copy_from_slice(&[0, 0, 1, 2]);

        device.stage_in(&ctx(), &host_in, &dev_in, 2).expect("stage_in");
        device.invoke(&ctx(), &dev_in, &dev_out, 2).expect("invoke");
        device.stage_out(&ctx(), &dev_out, &host_out, 2).expect("stage_out");

        let (mean, checksum) = decode_summary(&host_out.slot(0, 0).expect("slot")).expect("decode");
        assert!((mean - 1.0).abs() < f32::EPSILON);
        assert_eq!(checksum, 1020.0);
        let (_, checksum) = decode_summary(&host_out.slot(0, 1).expect("slot")).expect("decode");
        assert_eq!(checksum, 3.0);
    }

    #[test]
    fn raw_copy_pads_short_frames() {
        let frame = Frame::new(
            "cam-0",
            0,
            FrameDescriptor::packed(2, 1, PixelFormat::Rgb24),
            vec![9; 6],
        );
        let item = BatchItem::frame(Arc::new(frame));
        let mut slot = vec![1u8; 8];
        let mut inputs = [slot.as_mut_slice()];
        RawCopyPreprocessor
            .prepare(&item, 0, &mut inputs)
            .expect("prepare");
        assert_eq!(slot, vec![9, 9, 9, 9, 9, 9, 0, 0]);
    }

    #[test]
    fn score_postprocessor_applies_threshold() {
        let post = ScorePostprocessor::new();
        let shape = LoopbackDevice::new(4).model_shape();
        post.on_shape_known(
            &shape,
            &ProcessorParams {
                threshold: 0.5,
                ..ProcessorParams::default()
            },
        )
        .expect("shape accepted");

        let frame = Arc::new(Frame::new(
            "cam-0",
            1,
            FrameDescriptor::packed(2, 2, PixelFormat::Rgba32),
            vec![0; 16],
        ));
        let dim = BatchItem::frame(frame.clone());
        let summary = summarize(&[10, 10]);
        post.extract(&[&summary[..]], 0, &dim).expect("extract");
        assert!(frame.inferences().is_empty());

        let bright = BatchItem::frame(frame.clone());
        let summary = summarize(&[250, 250]);
        post.extract(&[&summary[..]], 0, &bright).expect("extract");
        assert_eq!(frame.inferences().len(), 1);
    }

    #[test]
    fn score_postprocessor_rejects_short_output() {
        let post = ScorePostprocessor::new();
        let frame = Arc::new(Frame::eos("cam-0", 0));
        let item = BatchItem::frame(frame);
        let err = post
            .extract(&[&[0u8; 3][..]], 0, &item)
            .expect_err("short output must fail");
        match err {
            EngineError::BufferTooSmall { need, have } => assert_eq!((need, have), (8, 3)),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
