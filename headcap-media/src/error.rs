//! Error taxonomy for the capture pipeline.
//!
//! Component errors are classified here so the controller can decide whether
//! to absorb them (transient) or end the run (fatal).

use std::time::Duration;

use thiserror::Error;

use crate::video_types::DisplayGeometry;

/// Errors from reading a virtual display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The display surface is gone; no further capture can succeed.
    #[error("capture unavailable: {0}")]
    Unavailable(String),
    /// A snapshot did not complete within the capture timeout.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
}

impl CaptureError {
    /// Whether the frame source may skip this tick and keep going.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Timeout(_))
    }
}

/// Errors from an output sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// This frame could not be encoded; the encoder is still usable.
    #[error("encode failed: {0}")]
    Failed(String),
    /// The encoder or its output cannot accept any more frames.
    #[error("encoder fatal: {0}")]
    Fatal(String),
}

impl EncodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EncodeError::Fatal(_))
    }
}

/// Errors surfaced by the pipeline controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("source exhausted after {failures} consecutive capture failures")]
    SourceExhausted { failures: u32 },

    #[error("captured frame ({actual_len} bytes) does not match display geometry {expected}")]
    GeometryMismatch {
        expected: DisplayGeometry,
        actual_len: usize,
    },

    #[error("encoder fatal: {0}")]
    EncoderFatal(String),

    #[error("pipeline already running")]
    AlreadyRunning,

    #[error("pipeline was never started")]
    NotStarted,

    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    /// A pipeline task panicked or was cancelled.
    #[error("pipeline task aborted: {0}")]
    TaskAborted(String),
}
