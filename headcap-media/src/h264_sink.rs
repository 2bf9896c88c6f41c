//! Output sink writing an H.264 Annex-B elementary stream with OpenH264.
//!
//! Requires the `video-codec` feature to be enabled. The output has no
//! container, so constant-rate timing is kept by re-encoding the previous
//! picture across pts gaps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;

use crate::encoder::{OutputSink, SinkOpener};
use crate::error::EncodeError;
use crate::video_types::{DisplayGeometry, Frame, PixelFormat};

/// Default target bitrate: 4 Mbps suits 1080p screen content.
pub const DEFAULT_BITRATE_BPS: u32 = 4_000_000;

const MAX_PADDING_FRAMES: u64 = 300;

/// Opens [`H264FileSink`]s.
#[derive(Debug, Clone)]
pub struct H264SinkOpener {
    bitrate_bps: u32,
}

impl Default for H264SinkOpener {
    fn default() -> Self {
        Self {
            bitrate_bps: DEFAULT_BITRATE_BPS,
        }
    }
}

impl H264SinkOpener {
    pub fn with_bitrate(bitrate_bps: u32) -> Self {
        Self { bitrate_bps }
    }
}

impl SinkOpener for H264SinkOpener {
    fn open(
        &mut self,
        geometry: DisplayGeometry,
        frame_rate: u32,
        path: &Path,
    ) -> Result<Box<dyn OutputSink>, EncodeError> {
        H264FileSink::create(geometry, frame_rate, self.bitrate_bps, path)
            .map(|sink| Box::new(sink) as Box<dyn OutputSink>)
    }
}

/// OpenH264 encoder streaming NAL units into a file.
pub struct H264FileSink {
    encoder: Encoder,
    out: BufWriter<File>,
    path: PathBuf,
    width: usize,
    height: usize,
    next_pts: u64,
    previous: Vec<u8>,
    frames_written: u64,
    frames_padded: u64,
    bytes_written: u64,
}

impl H264FileSink {
    /// Create the encoder and the output file.
    ///
    /// `geometry` width and height must be even.
    pub fn create(
        geometry: DisplayGeometry,
        frame_rate: u32,
        bitrate_bps: u32,
        path: &Path,
    ) -> Result<Self, EncodeError> {
        if geometry.width % 2 != 0 || geometry.height % 2 != 0 {
            return Err(EncodeError::Fatal(format!(
                "H.264 needs even dimensions, display is {}x{}",
                geometry.width, geometry.height
            )));
        }

        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(frame_rate as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| EncodeError::Fatal(format!("failed to create encoder: {e}")))?;

        let file = File::create(path)
            .map_err(|e| EncodeError::Fatal(format!("create {}: {e}", path.display())))?;

        tracing::info!(
            width = geometry.width,
            height = geometry.height,
            frame_rate,
            bitrate_bps,
            output = %path.display(),
            "H.264 encoder created"
        );

        Ok(Self {
            encoder,
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            width: geometry.width as usize,
            height: geometry.height as usize,
            next_pts: 0,
            previous: Vec::new(),
            frames_written: 0,
            frames_padded: 0,
            bytes_written: 0,
        })
    }

    fn encode_picture(&mut self, i420: &[u8]) -> Result<(), EncodeError> {
        let (w, h) = (self.width, self.height);
        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);

        let y_plane = &i420[..y_size];
        let u_plane = &i420[y_size..y_size + uv_size];
        let v_plane = &i420[y_size + uv_size..y_size + uv_size * 2];
        let yuv = YUVSlices::new((y_plane, u_plane, v_plane), (w, h), (w, w / 2, w / 2));

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| EncodeError::Failed(format!("encode failed: {e}")))?;
        let bytes = bitstream.to_vec();

        self.out
            .write_all(&bytes)
            .map_err(|e| EncodeError::Fatal(format!("write {}: {e}", self.path.display())))?;
        self.bytes_written += bytes.len() as u64;

        tracing::trace!(bytes = bytes.len(), "encoded picture");
        Ok(())
    }
}

impl OutputSink for H264FileSink {
    fn input_format(&self) -> PixelFormat {
        PixelFormat::I420
    }

    fn submit(&mut self, frame: &Frame, pts: u64) -> Result<(), EncodeError> {
        if frame.format() != PixelFormat::I420
            || frame.width() as usize != self.width
            || frame.height() as usize != self.height
        {
            return Err(EncodeError::Failed(format!(
                "frame {} is {}, encoder expects {}x{} yuv420p",
                frame.sequence(),
                frame.geometry(),
                self.width,
                self.height
            )));
        }

        if self.frames_written > 0 && pts > self.next_pts {
            let padding = (pts - self.next_pts).min(MAX_PADDING_FRAMES);
            let previous = std::mem::take(&mut self.previous);
            let mut result = Ok(());
            for _ in 0..padding {
                result = self.encode_picture(&previous);
                if result.is_err() {
                    break;
                }
                self.frames_padded += 1;
            }
            self.previous = previous;
            result?;
        }

        self.encode_picture(frame.data())?;
        self.previous.clear();
        self.previous.extend_from_slice(frame.data());
        self.frames_written += 1;
        self.next_pts = pts + 1;
        Ok(())
    }

    fn frames_padded(&self) -> u64 {
        self.frames_padded
    }

    fn finalize(self: Box<Self>) -> Result<(), EncodeError> {
        let Self {
            out,
            path,
            frames_written,
            frames_padded,
            bytes_written,
            ..
        } = *self;

        let file = out
            .into_inner()
            .map_err(|e| EncodeError::Fatal(format!("flush {}: {}", path.display(), e.error())))?;
        file.sync_all()
            .map_err(|e| EncodeError::Fatal(format!("sync {}: {e}", path.display())))?;
        drop(file);

        if frames_written == 0 {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(error = %e, "failed to remove empty output");
            }
            return Ok(());
        }

        tracing::info!(
            frames_written,
            frames_padded,
            bytes_written,
            output = %path.display(),
            "H.264 stream finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn i420_frame(seq: u64, width: u32, height: u32) -> Frame {
        let rgba: Vec<u8> = (0..width * height)
            .flat_map(|i| [(i % 256) as u8, (seq * 20 % 256) as u8, 128, 255])
            .collect();
        let geometry = DisplayGeometry::new(width, height, PixelFormat::Rgba);
        let frame = Frame::new(seq, seq * 33_000_000, geometry, rgba).unwrap();
        convert::convert(frame, PixelFormat::I420).unwrap()
    }

    #[test]
    fn rejects_odd_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = DisplayGeometry::new(65, 48, PixelFormat::Bgra);
        let err = H264FileSink::create(geometry, 30, DEFAULT_BITRATE_BPS, &dir.path().join("odd.h264"))
            .err()
            .expect("odd width must be rejected");
        assert!(err.is_fatal());
    }

    #[test]
    fn writes_annex_b_stream_with_padding() {
        init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let geometry = DisplayGeometry::new(64, 48, PixelFormat::Bgra);

        let mut sink = H264SinkOpener::default().open(geometry, 30, &path).unwrap();
        assert_eq!(sink.input_format(), PixelFormat::I420);

        sink.submit(&i420_frame(0, 64, 48), 0).unwrap();
        sink.submit(&i420_frame(1, 64, 48), 1).unwrap();
        // Two slots skipped.
        sink.submit(&i420_frame(2, 64, 48), 4).unwrap();
        assert_eq!(sink.frames_padded(), 2);
        sink.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 4);
        assert!(
            bytes.starts_with(&[0, 0, 0, 1]) || bytes.starts_with(&[0, 0, 1]),
            "stream must start with an Annex-B start code"
        );
    }

    #[test]
    fn mismatched_frame_is_skippable() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = DisplayGeometry::new(64, 48, PixelFormat::Bgra);
        let mut sink = H264SinkOpener::default()
            .open(geometry, 30, &dir.path().join("out.h264"))
            .unwrap();

        let err = sink.submit(&i420_frame(0, 32, 24), 0).unwrap_err();
        assert!(!err.is_fatal());
        sink.finalize().unwrap();
        assert!(!dir.path().join("out.h264").exists());
    }
}
