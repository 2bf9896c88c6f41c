//! Synthetic display and in-memory sink for headless runs and tests.
//!
//! `SyntheticDisplay` renders a moving gradient and can be scripted to stall,
//! time out, resize, or vanish at chosen snapshots. `MemorySinkOpener`
//! records everything the encoder hands it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::display::VirtualDisplay;
use crate::encoder::{OutputSink, SinkOpener};
use crate::error::{CaptureError, EncodeError};
use crate::video_types::{DisplayGeometry, Frame, PixelFormat};

/// Behaviour of one scripted snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStep {
    /// Return a normal frame.
    Frame,
    /// Report a timeout without blocking.
    Timeout,
    /// Report the display as gone.
    Unavailable,
    /// Block for the given duration, then return a normal frame.
    Stall(Duration),
    /// Return a buffer sized for a different resolution.
    Resize(u32, u32),
}

/// Offscreen BGRA display backed by nothing but arithmetic.
pub struct SyntheticDisplay {
    geometry: DisplayGeometry,
    script: Mutex<VecDeque<SnapshotStep>>,
    fallback: SnapshotStep,
    snapshots: AtomicU64,
}

impl SyntheticDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            geometry: DisplayGeometry::new(width, height, PixelFormat::Bgra),
            script: Mutex::new(VecDeque::new()),
            fallback: SnapshotStep::Frame,
            snapshots: AtomicU64::new(0),
        }
    }

    /// Steps consumed one per snapshot before falling back.
    pub fn with_script(self, steps: impl IntoIterator<Item = SnapshotStep>) -> Self {
        *lock(&self.script) = steps.into_iter().collect();
        self
    }

    /// Step used once the script is exhausted. Defaults to [`SnapshotStep::Frame`].
    pub fn with_fallback(mut self, step: SnapshotStep) -> Self {
        self.fallback = step;
        self
    }

    /// Snapshots attempted so far.
    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }

    fn render(&self, width: u32, height: u32, tick: u64) -> Vec<u8> {
        let t = tick as u32;
        let mut data = Vec::with_capacity(PixelFormat::Bgra.frame_size(width, height));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    (x.wrapping_add(t * 4)) as u8,
                    (y.wrapping_add(t * 2)) as u8,
                    (t.wrapping_mul(8)) as u8,
                    0xff,
                ]);
            }
        }
        data
    }
}

impl VirtualDisplay for SyntheticDisplay {
    fn geometry(&self) -> DisplayGeometry {
        self.geometry
    }

    fn snapshot(&self) -> Result<Vec<u8>, CaptureError> {
        let tick = self.snapshots.fetch_add(1, Ordering::Relaxed);
        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let DisplayGeometry { width, height, .. } = self.geometry;
        match step {
            SnapshotStep::Frame => Ok(self.render(width, height, tick)),
            SnapshotStep::Timeout => Err(CaptureError::Timeout(Duration::ZERO)),
            SnapshotStep::Unavailable => Err(CaptureError::Unavailable(
                "synthetic display torn down".into(),
            )),
            SnapshotStep::Stall(delay) => {
                std::thread::sleep(delay);
                Ok(self.render(width, height, tick))
            }
            SnapshotStep::Resize(w, h) => Ok(self.render(w, h, tick)),
        }
    }
}

/// Everything a [`MemorySinkOpener`]'s sinks observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkRecord {
    pub opened: u32,
    pub geometry: Option<DisplayGeometry>,
    /// `(sequence, pts)` of every accepted frame, in submission order.
    pub submitted: Vec<(u64, u64)>,
    pub submissions: u64,
    pub finalized: u32,
}

impl SinkRecord {
    pub fn sequences(&self) -> Vec<u64> {
        self.submitted.iter().map(|(seq, _)| *seq).collect()
    }
}

/// Shared view of a [`MemorySinkOpener`]'s record.
#[derive(Debug, Clone, Default)]
pub struct SinkLog(Arc<Mutex<SinkRecord>>);

impl SinkLog {
    pub fn snapshot(&self) -> SinkRecord {
        lock(&self.0).clone()
    }

    fn record(&self) -> MutexGuard<'_, SinkRecord> {
        lock(&self.0)
    }
}

/// Opens sinks that keep nothing but a log of what they were given.
#[derive(Debug, Clone)]
pub struct MemorySinkOpener {
    log: SinkLog,
    input_format: PixelFormat,
    fail_at: Option<(u64, EncodeError)>,
    submit_delay: Duration,
    open_error: Option<EncodeError>,
}

impl Default for MemorySinkOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySinkOpener {
    pub fn new() -> Self {
        Self {
            log: SinkLog::default(),
            input_format: PixelFormat::Bgra,
            fail_at: None,
            submit_delay: Duration::ZERO,
            open_error: None,
        }
    }

    /// Pixel format the sinks ask for. Defaults to BGRA.
    pub fn with_input_format(mut self, format: PixelFormat) -> Self {
        self.input_format = format;
        self
    }

    /// Fail the `n`th submission (1-based) with `error`.
    pub fn fail_on_submission(mut self, n: u64, error: EncodeError) -> Self {
        self.fail_at = Some((n, error));
        self
    }

    /// Sleep this long inside every submission.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Refuse to open.
    pub fn fail_open(mut self, error: EncodeError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn log(&self) -> SinkLog {
        self.log.clone()
    }
}

impl SinkOpener for MemorySinkOpener {
    fn open(
        &mut self,
        geometry: DisplayGeometry,
        _frame_rate: u32,
        _path: &Path,
    ) -> Result<Box<dyn OutputSink>, EncodeError> {
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        {
            let mut record = self.log.record();
            record.opened += 1;
            record.geometry = Some(geometry);
        }
        Ok(Box::new(MemorySink {
            log: self.log.clone(),
            geometry: DisplayGeometry::new(geometry.width, geometry.height, self.input_format),
            fail_at: self.fail_at.clone(),
            submit_delay: self.submit_delay,
        }))
    }
}

struct MemorySink {
    log: SinkLog,
    geometry: DisplayGeometry,
    fail_at: Option<(u64, EncodeError)>,
    submit_delay: Duration,
}

impl OutputSink for MemorySink {
    fn input_format(&self) -> PixelFormat {
        self.geometry.format
    }

    fn submit(&mut self, frame: &Frame, pts: u64) -> Result<(), EncodeError> {
        if !self.submit_delay.is_zero() {
            std::thread::sleep(self.submit_delay);
        }

        let mut record = self.log.record();
        record.submissions += 1;
        if let Some((n, error)) = &self.fail_at {
            if record.submissions == *n {
                return Err(error.clone());
            }
        }
        if frame.geometry() != self.geometry {
            return Err(EncodeError::Failed(format!(
                "frame {} is {}, sink expects {}",
                frame.sequence(),
                frame.geometry(),
                self.geometry
            )));
        }
        record.submitted.push((frame.sequence(), pts));
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), EncodeError> {
        self.log.record().finalized += 1;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
