//! Frame source: samples a virtual display at a fixed rate into the frame queue.
//!
//! Snapshots run on the blocking pool under the capture timeout. A snapshot
//! that overruns is left to finish in the background; ticks that arrive while
//! it is still stuck count as further timeouts rather than piling up threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PipelineConfig;
use crate::display::VirtualDisplay;
use crate::error::{CaptureError, PipelineError};
use crate::frame_queue::{Enqueued, FrameQueue, QueueClosed};
use crate::pipeline::{PipelineMetrics, PipelineState};
use crate::video_types::Frame;

type Snapshot = JoinHandle<Result<Vec<u8>, CaptureError>>;

/// Producer half of the pipeline.
pub struct FrameSource {
    display: Arc<dyn VirtualDisplay>,
    queue: Arc<FrameQueue>,
    interval: Duration,
    capture_timeout: Duration,
    max_consecutive_failures: u32,
    metrics: Arc<PipelineMetrics>,
    state: watch::Receiver<PipelineState>,
    epoch: Instant,
}

impl FrameSource {
    pub fn new(
        display: Arc<dyn VirtualDisplay>,
        queue: Arc<FrameQueue>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        state: watch::Receiver<PipelineState>,
    ) -> Self {
        Self {
            display,
            queue,
            interval: config.frame_interval(),
            capture_timeout: config.capture_timeout(),
            max_consecutive_failures: config.max_consecutive_failures,
            metrics,
            state,
            epoch: Instant::now(),
        }
    }

    /// Capture until the pipeline leaves `Running` or capture fails fatally.
    ///
    /// Returns the number of frames captured. The queue is closed on every
    /// exit path so the encoder can drain and finish.
    pub async fn run(mut self) -> Result<u64, PipelineError> {
        let geometry = self.display.geometry();
        tracing::info!(%geometry, interval = ?self.interval, "frame source started");

        let result = self.capture_loop().await;
        self.queue.close();

        match &result {
            Ok(captured) => tracing::info!(captured, "frame source stopped"),
            Err(e) => tracing::error!(error = %e, "frame source failed"),
        }
        result
    }

    async fn capture_loop(&mut self) -> Result<u64, PipelineError> {
        let geometry = self.display.geometry();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sequence = 0u64;
        let mut last_timestamp = 0u64;
        let mut consecutive_failures = 0u32;
        let mut stuck: Option<Snapshot> = None;

        loop {
            if !self.state.borrow_and_update().is_running() {
                break;
            }

            tokio::select! {
                biased;
                changed = self.state.changed() => {
                    if changed.is_err() {
                        tracing::debug!("pipeline controller dropped, stopping capture");
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let data = match self.snapshot(&mut stuck).await {
                Ok(data) => data,
                Err(CaptureError::Timeout(limit)) => {
                    consecutive_failures += 1;
                    self.metrics.capture_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        ?limit,
                        consecutive_failures,
                        max = self.max_consecutive_failures,
                        "display snapshot timed out, skipping tick"
                    );
                    if consecutive_failures >= self.max_consecutive_failures {
                        return Err(PipelineError::SourceExhausted {
                            failures: consecutive_failures,
                        });
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            consecutive_failures = 0;

            let elapsed = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
            let timestamp_ns = elapsed.max(last_timestamp);
            last_timestamp = timestamp_ns;

            let frame = Frame::new(sequence, timestamp_ns, geometry, data).map_err(|actual_len| {
                PipelineError::GeometryMismatch {
                    expected: geometry,
                    actual_len,
                }
            })?;

            match self.queue.push(frame) {
                Ok(Enqueued::Accepted) => {}
                Ok(Enqueued::EvictedOldest(_)) => {
                    self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(QueueClosed(frame)) => {
                    tracing::debug!(sequence = frame.sequence(), "frame queue closed, stopping capture");
                    break;
                }
            }
            sequence += 1;
            self.metrics.frames_captured.fetch_add(1, Ordering::Relaxed);
        }

        Ok(sequence)
    }

    /// Take one snapshot bounded by the capture timeout.
    async fn snapshot(&self, stuck: &mut Option<Snapshot>) -> Result<Vec<u8>, CaptureError> {
        if let Some(handle) = stuck.as_ref() {
            if !handle.is_finished() {
                return Err(CaptureError::Timeout(self.capture_timeout));
            }
            // Late result of a snapshot that already timed out.
            *stuck = None;
        }

        let display = Arc::clone(&self.display);
        let mut handle = tokio::task::spawn_blocking(move || display.snapshot());

        match tokio::time::timeout(self.capture_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CaptureError::Unavailable(format!("snapshot task aborted: {e}"))),
            Err(_) => {
                *stuck = Some(handle);
                Err(CaptureError::Timeout(self.capture_timeout))
            }
        }
    }
}
