//! Shared types for captured frames and display geometry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pixel format of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// BGRA 8-bit per channel (4 bytes per pixel). X11 ZPixmap at depth 24/32.
    Bgra,
    /// RGBA 8-bit per channel (4 bytes per pixel).
    Rgba,
    /// I420 / YUV420P (YUV 4:2:0 planar, Y, U, V separate planes).
    I420,
    /// NV12 (YUV 4:2:0 semi-planar).
    Nv12,
}

impl PixelFormat {
    /// Number of bytes a `width` x `height` frame occupies in this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Bgra | PixelFormat::Rgba => w * h * 4,
            PixelFormat::I420 | PixelFormat::Nv12 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    /// Name ffmpeg's `rawvideo` demuxer uses for this layout.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgba => "rgba",
            PixelFormat::I420 => "yuv420p",
            PixelFormat::Nv12 => "nv12",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// Size and layout of a display surface. Fixed for a display handle's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl DisplayGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Expected byte length of one snapshot.
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

impl fmt::Display for DisplayGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// One timestamped capture of a display's pixel contents.
///
/// Frames are immutable once built. The pixel buffer is moved, never cloned,
/// from the frame source through the queue into the encoder.
#[derive(Debug)]
pub struct Frame {
    sequence: u64,
    timestamp_ns: u64,
    geometry: DisplayGeometry,
    data: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking that `data` matches `geometry`.
    ///
    /// Returns the buffer length on mismatch.
    pub fn new(
        sequence: u64,
        timestamp_ns: u64,
        geometry: DisplayGeometry,
        data: Vec<u8>,
    ) -> Result<Self, usize> {
        if data.len() != geometry.frame_size() {
            return Err(data.len());
        }
        Ok(Self {
            sequence,
            timestamp_ns,
            geometry,
            data,
        })
    }

    /// Monotonic, unique sequence number assigned by the frame source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time in nanoseconds since the pipeline clock epoch.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn geometry(&self) -> DisplayGeometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take ownership of the pixel buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Bgra.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Rgba.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::I420.frame_size(4, 2), 12);
        assert_eq!(PixelFormat::Nv12.frame_size(320, 240), 320 * 240 * 3 / 2);
        // Odd dimensions round chroma up.
        assert_eq!(PixelFormat::I420.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        let geometry = DisplayGeometry::new(2, 2, PixelFormat::Bgra);
        assert_eq!(Frame::new(0, 0, geometry, vec![0; 15]).unwrap_err(), 15);

        let frame = Frame::new(7, 42, geometry, vec![0; 16]).unwrap();
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.timestamp_ns(), 42);
        assert_eq!(frame.format(), PixelFormat::Bgra);
        assert_eq!(frame.into_data().len(), 16);
    }

    #[test]
    fn geometry_display() {
        let geometry = DisplayGeometry::new(1280, 720, PixelFormat::Bgra);
        assert_eq!(geometry.to_string(), "1280x720 bgra");
    }
}
