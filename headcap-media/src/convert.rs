//! Pixel format conversion between capture and encoder layouts.
//!
//! Packed 4-byte formats (BGRA/RGBA) convert to each other in place. Packed to
//! I420 uses BT.601 coefficients with 2x2 chroma averaging; odd edges reuse
//! the last row/column.

use crate::error::EncodeError;
use crate::video_types::{DisplayGeometry, Frame, PixelFormat};

/// Byte offsets of the colour channels inside a packed 4-byte pixel.
#[derive(Debug, Clone, Copy)]
struct ChannelOrder {
    r: usize,
    g: usize,
    b: usize,
}

const RGBA: ChannelOrder = ChannelOrder { r: 0, g: 1, b: 2 };
const BGRA: ChannelOrder = ChannelOrder { r: 2, g: 1, b: 0 };

fn packed_order(format: PixelFormat) -> Option<ChannelOrder> {
    match format {
        PixelFormat::Rgba => Some(RGBA),
        PixelFormat::Bgra => Some(BGRA),
        PixelFormat::I420 | PixelFormat::Nv12 => None,
    }
}

/// Convert `frame` to `target`, reusing its buffer where the layout allows.
///
/// Frames already in `target` are returned untouched.
pub fn convert(frame: Frame, target: PixelFormat) -> Result<Frame, EncodeError> {
    let source = frame.format();
    if source == target {
        return Ok(frame);
    }

    let (sequence, timestamp_ns) = (frame.sequence(), frame.timestamp_ns());
    let (width, height) = (frame.width(), frame.height());

    let data = match (packed_order(source), target) {
        (Some(_), PixelFormat::Rgba | PixelFormat::Bgra) => {
            let mut data = frame.into_data();
            swap_red_blue(&mut data);
            data
        }
        (Some(order), PixelFormat::I420) => packed_to_i420(frame.data(), width, height, order),
        (None, PixelFormat::Rgba | PixelFormat::Bgra) if source == PixelFormat::I420 => {
            let mut rgba = i420_to_rgba(frame.data(), width, height);
            if target == PixelFormat::Bgra {
                swap_red_blue(&mut rgba);
            }
            rgba
        }
        _ => {
            return Err(EncodeError::Failed(format!(
                "no conversion from {source} to {target}"
            )))
        }
    };

    let geometry = DisplayGeometry::new(width, height, target);
    Frame::new(sequence, timestamp_ns, geometry, data).map_err(|len| {
        EncodeError::Failed(format!(
            "conversion of frame {sequence} to {target} produced {len} bytes"
        ))
    })
}

/// Swap the R and B channels of packed 4-byte pixels in place.
pub fn swap_red_blue(pixels: &mut [u8]) {
    for chunk in pixels.chunks_exact_mut(4) {
        chunk.swap(0, 2);
    }
}

/// Convert packed RGBA pixel data to I420 (YUV 4:2:0 planar).
pub fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    packed_to_i420(rgba, width, height, RGBA)
}

/// Convert packed BGRA pixel data to I420 (YUV 4:2:0 planar).
pub fn bgra_to_i420(bgra: &[u8], width: u32, height: u32) -> Vec<u8> {
    packed_to_i420(bgra, width, height, BGRA)
}

fn packed_to_i420(packed: &[u8], width: u32, height: u32, order: ChannelOrder) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let uv_w = w.div_ceil(2);
    let uv_h = h.div_ceil(2);
    let y_size = w * h;
    let uv_size = uv_w * uv_h;
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    let rgb_at = |row: usize, col: usize| {
        let idx = (row * w + col) * 4;
        (
            packed[idx + order.r] as f32,
            packed[idx + order.g] as f32,
            packed[idx + order.b] as f32,
        )
    };

    for row in 0..h {
        for col in 0..w {
            let (r, g, b) = rgb_at(row, col);
            y_plane[row * w + col] = (0.299 * r + 0.587 * g + 0.114 * b)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }

    for uv_row in 0..uv_h {
        for uv_col in 0..uv_w {
            let (mut r_sum, mut g_sum, mut b_sum) = (0.0f32, 0.0f32, 0.0f32);
            for dr in 0..2 {
                for dc in 0..2 {
                    let row = (uv_row * 2 + dr).min(h - 1);
                    let col = (uv_col * 2 + dc).min(w - 1);
                    let (r, g, b) = rgb_at(row, col);
                    r_sum += r;
                    g_sum += g;
                    b_sum += b;
                }
            }
            let r = r_sum / 4.0;
            let g = g_sum / 4.0;
            let b = b_sum / 4.0;

            let uv_idx = uv_row * uv_w + uv_col;
            u_plane[uv_idx] = (-0.169 * r - 0.331 * g + 0.500 * b + 128.0)
                .round()
                .clamp(0.0, 255.0) as u8;
            v_plane[uv_idx] = (0.500 * r - 0.419 * g - 0.081 * b + 128.0)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }

    yuv
}

/// Convert I420 (YUV 4:2:0 planar) to RGBA pixel data.
pub fn i420_to_rgba(yuv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let uv_w = w.div_ceil(2);
    let uv_size = uv_w * h.div_ceil(2);
    let y_size = w * h;

    let y_plane = &yuv[..y_size];
    let u_plane = &yuv[y_size..y_size + uv_size];
    let v_plane = &yuv[y_size + uv_size..y_size + uv_size * 2];

    let mut rgba = vec![255u8; w * h * 4];

    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32;
            let uv_idx = (row / 2) * uv_w + (col / 2);
            let u = u_plane[uv_idx] as f32 - 128.0;
            let v = v_plane[uv_idx] as f32 - 128.0;

            let out_idx = (row * w + col) * 4;
            rgba[out_idx] = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
            rgba[out_idx + 1] = (y - 0.344 * u - 0.714 * v).round().clamp(0.0, 255.0) as u8;
            rgba[out_idx + 2] = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
        }
    }

    rgba
}
