//! Virtual display handle contract.

use crate::error::CaptureError;
use crate::video_types::DisplayGeometry;

/// A running offscreen display surface that can be sampled.
///
/// `snapshot` may block (it talks to a display server), so the frame source
/// calls it from the blocking pool and bounds it with the capture timeout.
pub trait VirtualDisplay: Send + Sync + 'static {
    /// Display size and pixel layout. Constant for the handle's lifetime.
    fn geometry(&self) -> DisplayGeometry;

    /// Read the current pixel contents.
    ///
    /// Fails with [`CaptureError::Unavailable`] once the display is torn down.
    fn snapshot(&self) -> Result<Vec<u8>, CaptureError>;
}
