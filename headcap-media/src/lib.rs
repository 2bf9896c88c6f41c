//! Headless display capture, frame queueing, and video encoding pipeline.

pub mod config;
pub mod convert;
pub mod display;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod frame_queue;
pub mod frame_source;
#[cfg(feature = "video-codec")]
pub mod h264_sink;
pub mod pipeline;
pub mod synthetic;
pub mod video_types;
pub mod x11_display;

pub use config::PipelineConfig;
pub use error::{CaptureError, EncodeError, PipelineError};
pub use pipeline::{MetricsSnapshot, Pipeline, PipelineOutcome, PipelineState};
