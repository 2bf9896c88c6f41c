//! Virtual display handle backed by an X11 server (typically Xvfb).
//!
//! Uses `x11rb`'s pure-Rust connection and reads the root window with
//! `GetImage` in ZPixmap format, which on little-endian 24/32-bit visuals is
//! BGRA with an undefined alpha byte.

use std::time::Duration;

use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat, ImageOrder, Window};
use x11rb::rust_connection::RustConnection;

use crate::display::VirtualDisplay;
use crate::error::CaptureError;
use crate::video_types::{DisplayGeometry, PixelFormat};

/// Handle to the root window of a running X display.
pub struct X11Display {
    conn: RustConnection,
    root: Window,
    geometry: DisplayGeometry,
    name: String,
}

impl X11Display {
    /// Connect to `display_name` (e.g. `":99"`), or `$DISPLAY` when `None`.
    pub fn connect(display_name: Option<&str>) -> Result<Self, CaptureError> {
        let name = display_name
            .map(str::to_owned)
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0".into());

        let (conn, screen_num) = RustConnection::connect(Some(&name))
            .map_err(|e| CaptureError::Unavailable(format!("connect to {name}: {e}")))?;

        let setup = conn.setup();
        if setup.image_byte_order != ImageOrder::LSB_FIRST {
            return Err(CaptureError::Unavailable(format!(
                "display {name} uses MSB-first images, only LSB-first is supported"
            )));
        }

        let screen = setup.roots.get(screen_num).ok_or_else(|| {
            CaptureError::Unavailable(format!("display {name} has no screen {screen_num}"))
        })?;

        let bits_per_pixel = setup
            .pixmap_formats
            .iter()
            .find(|f| f.depth == screen.root_depth)
            .map(|f| f.bits_per_pixel);
        if bits_per_pixel != Some(32) {
            return Err(CaptureError::Unavailable(format!(
                "display {name} root depth {} ({:?} bpp) is not a 32-bit pixmap format",
                screen.root_depth, bits_per_pixel
            )));
        }

        let root = screen.root;
        let geometry = DisplayGeometry::new(
            u32::from(screen.width_in_pixels),
            u32::from(screen.height_in_pixels),
            PixelFormat::Bgra,
        );

        tracing::info!(
            display = %name,
            screen = screen_num,
            root,
            %geometry,
            "connected to X display"
        );

        Ok(Self {
            conn,
            root,
            geometry,
            name,
        })
    }

    /// Display name this handle is connected to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VirtualDisplay for X11Display {
    fn geometry(&self) -> DisplayGeometry {
        self.geometry
    }

    fn snapshot(&self) -> Result<Vec<u8>, CaptureError> {
        let cookie = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                0,
                0,
                self.geometry.width as u16,
                self.geometry.height as u16,
                !0,
            )
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.name)))?;

        let image = cookie.reply().map_err(|e| reply_error(&self.name, e))?;

        Ok(image.data)
    }
}

/// Only a lost connection means the display is gone; a protocol error fails
/// this snapshot alone and counts toward the consecutive failure limit.
fn reply_error(name: &str, error: ReplyError) -> CaptureError {
    match error {
        ReplyError::X11Error(e) => {
            tracing::debug!(display = name, error = ?e, "GetImage rejected by X server");
            CaptureError::Timeout(Duration::ZERO)
        }
        other => CaptureError::Unavailable(format!("{name}: {other}")),
    }
}
