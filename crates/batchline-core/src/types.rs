//! Item model shared between the scheduler and its collaborators.
//!
//! # Ownership model
//!
//! A [`Frame`] arrives from the upstream decode/detection collaborator as an
//! `Arc<Frame>`; the scheduler never copies pixel content. Each schedulable
//! unit is a [`BatchItem`]: either the whole frame, or one
//! [`DetectedObject`] of it when the engine runs in object mode.
//!
//! Results are attached through interior mutability so that per-item
//! extraction tasks running on different workers can write to their own item
//! without exclusive access to the frame.
//!
//! # Invariants
//!
//! 1. `data.len()` ≥ `descriptor.byte_len()` for every frame that is inferred
//!    (checked by [`FrameDescriptor::validate`]).
//! 2. An item's [`ItemOutcome`] leaves `Pending` at most once per chain; the
//!    scheduler's completion signal only means "done", the outcome says
//!    whether it succeeded.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Host pixel layout of a source buffer.
///
/// The scheduler does not interpret pixel content; the format only sizes the
/// buffer so that a truncated frame is rejected before a pre-processor reads
/// past its end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Y plane `height × stride` plus interleaved CbCr plane `height / 2 × stride`.
    Nv12,
    /// As `Nv12` with CrCb ordering.
    Nv21,
    /// Interleaved 8-bit RGB rows of `stride` bytes.
    Rgb24,
    /// Interleaved 8-bit BGR rows of `stride` bytes.
    Bgr24,
    /// Interleaved 8-bit RGBA rows of `stride` bytes.
    Rgba32,
}

impl PixelFormat {
    /// Minimum row stride in bytes for `width` pixels.
    #[inline]
    pub const fn min_stride(self, width: u32) -> usize {
        match self {
            Self::Nv12 | Self::Nv21 => width as usize,
            Self::Rgb24 | Self::Bgr24 => 3 * width as usize,
            Self::Rgba32 => 4 * width as usize,
        }
    }

    /// Total byte size of a buffer with the given geometry.
    #[inline]
    pub const fn byte_size(self, height: u32, stride: usize) -> usize {
        match self {
            Self::Nv12 | Self::Nv21 => stride * (height as usize) + stride * (height as usize / 2),
            Self::Rgb24 | Self::Bgr24 | Self::Rgba32 => stride * height as usize,
        }
    }
}

/// Geometry of a byte-addressable source buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: usize,
    pub format: PixelFormat,
}

impl FrameDescriptor {
    /// Dense descriptor: stride equals the minimum stride of `format`.
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: format.min_stride(width),
            format,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.format.byte_size(self.height, self.stride)
    }

    /// Check the descriptor against a buffer of `len` bytes.
    pub fn validate(&self, len: usize) -> Result<()> {
        let min_stride = self.format.min_stride(self.width);
        if self.stride < min_stride {
            return Err(EngineError::DimensionMismatch(format!(
                "stride {} is below the minimum {} for {}px {:?}",
                self.stride, min_stride, self.width, self.format
            )));
        }
        let need = self.byte_len();
        if len < need {
            return Err(EngineError::BufferTooSmall { need, have: len });
        }
        Ok(())
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// One result attached by a post-processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub label: i32,
    pub score: f32,
    /// Raw feature values, if the post-processor keeps them.
    #[serde(default)]
    pub values: Vec<f32>,
}

/// Normalized bounding box (`0.0..=1.0` in both axes).
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// An object found by an upstream detector, inferred individually in object
/// mode.
#[derive(Debug, Default)]
pub struct DetectedObject {
    pub label: i32,
    pub score: f32,
    pub bbox: BoundingBox,
    inferences: Mutex<Vec<Inference>>,
}

impl DetectedObject {
    pub fn new(label: i32, score: f32, bbox: BoundingBox) -> Self {
        Self {
            label,
            score,
            bbox,
            inferences: Mutex::new(Vec::new()),
        }
    }

    pub fn inferences(&self) -> Vec<Inference> {
        self.inferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One upstream work request.
#[derive(Debug)]
pub struct Frame {
    pub stream_id: String,
    pub frame_id: u64,
    pub descriptor: FrameDescriptor,
    /// Host pixel bytes described by `descriptor`. Empty for EOS markers.
    pub data: Vec<u8>,
    /// End-of-stream marker: flushes the open batch, never inferred.
    pub eos: bool,
    /// Upstream detections, consumed in object mode.
    pub objects: Vec<Arc<DetectedObject>>,
    inferences: Mutex<Vec<Inference>>,
}

impl Frame {
    pub fn new(
        stream_id: impl Into<String>,
        frame_id: u64,
        descriptor: FrameDescriptor,
        data: Vec<u8>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            frame_id,
            descriptor,
            data,
            eos: false,
            objects: Vec::new(),
            inferences: Mutex::new(Vec::new()),
        }
    }

    /// An end-of-stream marker for `stream_id`.
    pub fn eos(stream_id: impl Into<String>, frame_id: u64) -> Self {
        let mut frame = Self::new(
            stream_id,
            frame_id,
            FrameDescriptor::packed(0, 0, PixelFormat::Nv12),
            Vec::new(),
        );
        frame.eos = true;
        frame
    }

    pub fn with_objects(mut self, objects: Vec<Arc<DetectedObject>>) -> Self {
        self.objects = objects;
        self
    }

    pub fn inferences(&self) -> Vec<Inference> {
        self.inferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ─── Batch item ──────────────────────────────────────────────────────────────

/// Per-item result flag set by the extraction stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Pending,
    Succeeded,
    Failed(String),
    /// Not inferred (EOS marker or skipped by the inference interval).
    Skipped,
}

/// One schedulable unit: a frame, or one object of a frame.
#[derive(Debug)]
pub struct BatchItem {
    frame: Arc<Frame>,
    object: Option<Arc<DetectedObject>>,
    outcome: Mutex<ItemOutcome>,
}

impl BatchItem {
    pub fn frame(frame: Arc<Frame>) -> Self {
        Self {
            frame,
            object: None,
            outcome: Mutex::new(ItemOutcome::Pending),
        }
    }

    pub fn object(frame: Arc<Frame>, object: Arc<DetectedObject>) -> Self {
        Self {
            frame,
            object: Some(object),
            outcome: Mutex::new(ItemOutcome::Pending),
        }
    }

    pub fn source(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn detected_object(&self) -> Option<&Arc<DetectedObject>> {
        self.object.as_ref()
    }

    /// Append a result to the object (object mode) or the frame.
    pub fn attach(&self, inference: Inference) {
        let slot = match &self.object {
            Some(object) => &object.inferences,
            None => &self.frame.inferences,
        };
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(inference);
    }

    pub fn outcome(&self) -> ItemOutcome {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_outcome(&self, outcome: ItemOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_size_includes_chroma_plane() {
        let desc = FrameDescriptor::packed(64, 32, PixelFormat::Nv12);
        assert_eq!(desc.byte_len(), 64 * 32 + 64 * 16);
    }

    #[test]
    fn validate_rejects_short_buffer() {
        let desc = FrameDescriptor::packed(4, 4, PixelFormat::Rgb24);
        let err = desc.validate(10).expect_err("short buffer must fail");
        match err {
            EngineError::BufferTooSmall { need, have } => {
                assert_eq!(need, 48);
                assert_eq!(have, 10);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_narrow_stride() {
        let desc = FrameDescriptor {
            width: 8,
            height: 2,
            stride: 16,
            format: PixelFormat::Rgba32,
        };
        let err = desc.validate(1024).expect_err("stride below width must fail");
        assert!(err.to_string().contains("stride 16"));
    }

    #[test]
    fn attach_targets_object_in_object_mode() {
        let frame = Arc::new(Frame::new(
            "cam0",
            7,
            FrameDescriptor::packed(2, 2, PixelFormat::Rgb24),
            vec![0; 12],
        ));
        let object = Arc::new(DetectedObject::new(3, 0.9, BoundingBox::default()));
        let item = BatchItem::object(frame.clone(), object.clone());
        item.attach(Inference {
            label: 1,
            score: 0.5,
            values: Vec::new(),
        });
        assert_eq!(object.inferences().len(), 1);
        assert!(frame.inferences().is_empty());
    }

    #[test]
    fn outcome_starts_pending() {
        let item = BatchItem::frame(Arc::new(Frame::eos("cam0", 0)));
        assert_eq!(item.outcome(), ItemOutcome::Pending);
        item.set_outcome(ItemOutcome::Failed("bad".into()));
        assert_eq!(item.outcome(), ItemOutcome::Failed("bad".into()));
    }
}
