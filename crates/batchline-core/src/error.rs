//! Typed error hierarchy for the batching engine.
//!
//! Uses `thiserror` for library-grade errors. Stage bodies, collaborators and
//! the engine surface all return [`Result`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured telemetry without string parsing. A Task Node reports the
//! code of the error its body returned as its status.

/// All errors originating from the batching engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Config error: {0}")]
    Config(String),

    // ── Collaborators ────────────────────────────────────────────────
    #[error("Stage {stage} failed: {message}")]
    StageFailed {
        stage: &'static str,
        message: String,
    },

    #[error("Device error: {0}")]
    Device(String),

    // ── Scheduling ───────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Worker pool shutdown in progress")]
    Shutdown,

    // ── Type contracts ───────────────────────────────────────────────
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Batch slot {slot} out of range (buffer holds {slots} slots)")]
    SlotOutOfRange { slot: usize, slots: usize },

    // ── Internal logic ───────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Batch overflow: open batch already holds {capacity} items")]
    BatchOverflow { capacity: usize },

    // ── Hardening ────────────────────────────────────────────────────
    #[error("Panic recovered in {stage}: {message}")]
    PanicRecovered {
        stage: &'static str,
        message: String,
    },

    #[error("Backpressure timeout: {stage} blocked for {elapsed_ms} ms")]
    BackpressureTimeout {
        stage: &'static str,
        elapsed_ms: u64,
    },
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: Configuration
    /// - 2xx: Collaborators (pre/post-processing, device)
    /// - 4xx: Scheduling
    /// - 5xx: Type contracts
    /// - 6xx: Internal logic
    /// - 7xx: Hardening
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Config(_) => 100,
            Self::StageFailed { .. } => 200,
            Self::Device(_) => 201,
            Self::Shutdown => 401,
            Self::Pipeline(_) => 402,
            Self::DimensionMismatch(_) => 501,
            Self::BufferTooSmall { .. } => 502,
            Self::SlotOutOfRange { .. } => 503,
            Self::InvariantViolation(_) => 600,
            Self::BatchOverflow { .. } => 601,
            Self::PanicRecovered { .. } => 700,
            Self::BackpressureTimeout { .. } => 702,
        }
    }

    /// Whether this error is recoverable (the batch keeps flowing after it is
    /// reported).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StageFailed { .. }
                | Self::Device(_)
                | Self::DimensionMismatch(_)
                | Self::BufferTooSmall { .. }
                | Self::PanicRecovered { .. }
                | Self::BackpressureTimeout { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
