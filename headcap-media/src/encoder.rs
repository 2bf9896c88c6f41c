//! Encoder pipeline: drains the frame queue into an output sink.
//!
//! The sink is opened lazily from the geometry of the first dequeued frame.
//! Each frame is converted to the sink's input format and submitted on the
//! blocking pool; the sink is moved into the blocking task and handed back, so
//! at most one submission is ever in flight and frames reach the sink in
//! sequence order.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::convert;
use crate::error::{EncodeError, PipelineError};
use crate::frame_queue::FrameQueue;
use crate::pipeline::PipelineMetrics;
use crate::video_types::{DisplayGeometry, Frame, PixelFormat};

/// An open output file accepting frames.
///
/// Methods may block; the encoder only calls them from the blocking pool.
pub trait OutputSink: Send + 'static {
    /// Pixel layout `submit` expects.
    fn input_format(&self) -> PixelFormat;

    /// Encode one frame at presentation index `pts` (in frame-interval units).
    ///
    /// `pts` is strictly increasing across calls.
    fn submit(&mut self, frame: &Frame, pts: u64) -> Result<(), EncodeError>;

    /// Duplicate frames written so far to fill pts gaps.
    fn frames_padded(&self) -> u64 {
        0
    }

    /// Flush and close the output. Called at most once.
    fn finalize(self: Box<Self>) -> Result<(), EncodeError>;
}

/// Creates the output sink once the capture geometry is known.
pub trait SinkOpener: Send + 'static {
    fn open(
        &mut self,
        geometry: DisplayGeometry,
        frame_rate: u32,
        path: &Path,
    ) -> Result<Box<dyn OutputSink>, EncodeError>;
}

/// What the encoder task reports back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderReport {
    pub frames_encoded: u64,
    /// Set only when the output was finalized and holds at least one frame.
    pub output: Option<PathBuf>,
    pub error: Option<PipelineError>,
}

/// Maps capture timestamps onto presentation indices at a fixed frame rate.
#[derive(Debug)]
pub(crate) struct PtsClock {
    frame_rate: u64,
    first_ns: Option<u64>,
    last: Option<u64>,
}

impl PtsClock {
    pub(crate) fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: u64::from(frame_rate.max(1)),
            first_ns: None,
            last: None,
        }
    }

    /// Presentation index for a frame captured at `timestamp_ns`.
    ///
    /// The first frame is pts 0. Later frames land on the nearest frame slot,
    /// bumped forward if that slot is already taken.
    pub(crate) fn pts_for(&mut self, timestamp_ns: u64) -> u64 {
        let first = *self.first_ns.get_or_insert(timestamp_ns);
        let elapsed = u128::from(timestamp_ns.saturating_sub(first));
        let slot = (elapsed * u128::from(self.frame_rate) + 500_000_000) / 1_000_000_000;
        let slot = u64::try_from(slot).unwrap_or(u64::MAX);

        let pts = match self.last {
            Some(last) if slot <= last => last + 1,
            _ => slot,
        };
        self.last = Some(pts);
        pts
    }
}

/// Consumer half of the pipeline.
pub struct EncoderPipeline {
    queue: Arc<FrameQueue>,
    opener: Box<dyn SinkOpener>,
    output: PathBuf,
    frame_rate: u32,
    metrics: Arc<PipelineMetrics>,
}

impl EncoderPipeline {
    pub fn new(
        queue: Arc<FrameQueue>,
        opener: Box<dyn SinkOpener>,
        output: PathBuf,
        frame_rate: u32,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            queue,
            opener,
            output,
            frame_rate,
            metrics,
        }
    }

    /// Drain the queue until it is closed and empty, or the sink fails fatally.
    ///
    /// The sink, if one was opened, is finalized exactly once before returning
    /// unless the blocking task holding it panicked.
    pub async fn run(mut self) -> EncoderReport {
        let mut sink: Option<Box<dyn OutputSink>> = None;
        let mut clock = PtsClock::new(self.frame_rate);
        let mut last_sequence: Option<u64> = None;
        let mut frames_encoded = 0u64;
        let mut sink_lost = false;

        tracing::debug!(output = %self.output.display(), "encoder started");

        let error = loop {
            let Some(frame) = self.queue.pop().await else {
                break None;
            };

            let sequence = frame.sequence();
            if last_sequence.is_some_and(|prev| sequence <= prev) {
                tracing::warn!(sequence, last = ?last_sequence, "out-of-order frame discarded");
                continue;
            }
            last_sequence = Some(sequence);

            let mut active = match sink.take() {
                Some(active) => active,
                None => match self.open_sink(frame.geometry()) {
                    Ok(active) => active,
                    Err(e) => break Some(e),
                },
            };

            let pts = clock.pts_for(frame.timestamp_ns());
            let metrics = Arc::clone(&self.metrics);
            let joined = tokio::task::spawn_blocking(move || {
                let result = encode_frame(active.as_mut(), frame, pts, &metrics);
                (active, result)
            })
            .await;

            match joined {
                Ok((active, Ok(()))) => {
                    sink = Some(active);
                    frames_encoded += 1;
                    self.metrics.frames_encoded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(sequence, pts, "frame encoded");
                }
                Ok((active, Err(EncodeError::Failed(reason)))) => {
                    sink = Some(active);
                    self.metrics.encode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sequence, %reason, "frame encode failed, skipping");
                }
                Ok((active, Err(EncodeError::Fatal(reason)))) => {
                    sink = Some(active);
                    tracing::error!(sequence, %reason, "encoder failed fatally");
                    break Some(PipelineError::EncoderFatal(reason));
                }
                Err(e) => {
                    sink_lost = true;
                    tracing::error!(sequence, error = %e, "encode task aborted, output lost");
                    break Some(PipelineError::EncoderFatal(format!("encode task aborted: {e}")));
                }
            }
        };

        if error.is_some() {
            // Stop the producer; remaining queued frames are discarded.
            self.queue.close();
            let discarded = std::iter::from_fn(|| self.queue.try_pop()).count();
            if discarded > 0 {
                tracing::debug!(discarded, "discarded queued frames after encoder failure");
            }
        }

        let finalized = match sink {
            Some(active) => Self::finalize(self.output.clone(), active).await,
            None => {
                if !sink_lost {
                    tracing::debug!("no frames reached the encoder, nothing to finalize");
                }
                Err(None)
            }
        };

        let (output, error) = match finalized {
            Ok(()) if frames_encoded > 0 => (Some(self.output.clone()), error),
            Ok(()) => (None, error),
            Err(Some(finalize_error)) => (None, error.or(Some(finalize_error))),
            Err(None) => (None, error),
        };

        tracing::info!(
            frames_encoded,
            output = ?output,
            failed = error.is_some(),
            "encoder finished"
        );

        EncoderReport {
            frames_encoded,
            output,
            error,
        }
    }

    fn open_sink(&mut self, geometry: DisplayGeometry) -> Result<Box<dyn OutputSink>, PipelineError> {
        match self.opener.open(geometry, self.frame_rate, &self.output) {
            Ok(sink) => {
                tracing::info!(
                    %geometry,
                    frame_rate = self.frame_rate,
                    input_format = %sink.input_format(),
                    output = %self.output.display(),
                    "output sink opened"
                );
                Ok(sink)
            }
            Err(e) => {
                tracing::error!(error = %e, output = %self.output.display(), "failed to open output sink");
                Err(PipelineError::EncoderFatal(format!(
                    "open {}: {e}",
                    self.output.display()
                )))
            }
        }
    }

    /// `Err(None)` means nothing to report beyond the original error.
    async fn finalize(
        output: PathBuf,
        sink: Box<dyn OutputSink>,
    ) -> Result<(), Option<PipelineError>> {
        match tokio::task::spawn_blocking(move || sink.finalize()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, output = %output.display(), "failed to finalize output");
                Err(Some(PipelineError::EncoderFatal(format!("finalize: {e}"))))
            }
            Err(e) => {
                tracing::error!(error = %e, "finalize task aborted");
                Err(Some(PipelineError::EncoderFatal(format!(
                    "finalize task aborted: {e}"
                ))))
            }
        }
    }
}

fn encode_frame(
    sink: &mut dyn OutputSink,
    frame: Frame,
    pts: u64,
    metrics: &PipelineMetrics,
) -> Result<(), EncodeError> {
    let target = sink.input_format();
    let frame = if frame.format() == target {
        frame
    } else {
        let converted = convert::convert(frame, target)?;
        metrics.frames_converted.fetch_add(1, Ordering::Relaxed);
        converted
    };
    let result = sink.submit(&frame, pts);
    metrics
        .frames_padded
        .store(sink.frames_padded(), Ordering::Relaxed);
    result
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::synthetic::MemorySinkOpener;

    const MS: u64 = 1_000_000;

    #[test]
    fn pts_follows_wall_clock() {
        let mut clock = PtsClock::new(10);
        // Capture clock epoch is arbitrary; the first frame anchors pts 0.
        assert_eq!(clock.pts_for(5_000 * MS), 0);
        assert_eq!(clock.pts_for(5_100 * MS), 1);
        assert_eq!(clock.pts_for(5_204 * MS), 2);
        // Two intervals skipped (dropped frames) leave a gap.
        assert_eq!(clock.pts_for(5_500 * MS), 5);
    }

    #[test]
    fn pts_is_strictly_increasing() {
        let mut clock = PtsClock::new(30);
        let mut last = None;
        for ts in [0, 1, 2, 3, 40 * MS, 41 * MS, 41 * MS] {
            let pts = clock.pts_for(ts);
            if let Some(prev) = last {
                assert!(pts > prev, "{pts} after {prev}");
            }
            last = Some(pts);
        }
    }

    /// Openers need only be `Send`; the encoder must still run on a spawned task.
    struct UnsyncOpener {
        inner: MemorySinkOpener,
        _unsync: Cell<()>,
    }

    impl SinkOpener for UnsyncOpener {
        fn open(
            &mut self,
            geometry: DisplayGeometry,
            frame_rate: u32,
            path: &Path,
        ) -> Result<Box<dyn OutputSink>, EncodeError> {
            self.inner.open(geometry, frame_rate, path)
        }
    }

    #[tokio::test]
    async fn spawned_encoder_drains_and_finalizes() {
        let opener = MemorySinkOpener::new();
        let log = opener.log();
        let queue = Arc::new(FrameQueue::new(4));
        let geometry = DisplayGeometry::new(2, 2, PixelFormat::Bgra);
        for seq in 0..3 {
            let frame = Frame::new(seq, seq * 100 * MS, geometry, vec![0; 16]).unwrap();
            queue.push(frame).unwrap();
        }
        queue.close();

        let encoder = EncoderPipeline::new(
            Arc::clone(&queue),
            Box::new(UnsyncOpener {
                inner: opener,
                _unsync: Cell::new(()),
            }),
            PathBuf::from("memory.out"),
            10,
            Arc::new(PipelineMetrics::default()),
        );
        let report = tokio::spawn(encoder.run()).await.unwrap();

        assert_eq!(report.frames_encoded, 3);
        assert_eq!(report.output, Some(PathBuf::from("memory.out")));
        assert!(report.error.is_none());
        let record = log.snapshot();
        assert_eq!(record.sequences(), vec![0, 1, 2]);
        assert_eq!(record.finalized, 1);
    }

    #[test]
    fn pts_never_goes_backwards_on_clock_regression() {
        let mut clock = PtsClock::new(10);
        assert_eq!(clock.pts_for(1_000 * MS), 0);
        assert_eq!(clock.pts_for(1_300 * MS), 3);
        assert_eq!(clock.pts_for(900 * MS), 4);
    }
}
