//! Capture pipeline controller: display → frame source → queue → encoder → file.
//!
//! `Pipeline` owns the lifecycle state machine. It spawns the capture and
//! encode loops as independent tasks joined only by the [`FrameQueue`], and a
//! supervisor task that settles the final [`PipelineOutcome`].
//!
//! ```text
//! Idle ──start──▶ Running ──stop / source failure──▶ Draining ──flushed──▶ Stopped
//!                    │                                   │
//!                    └────────── fatal error ────────────┴──────────────▶ Failed
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::display::VirtualDisplay;
use crate::encoder::{EncoderPipeline, EncoderReport, SinkOpener};
use crate::error::PipelineError;
use crate::frame_queue::FrameQueue;
use crate::frame_source::FrameSource;

/// Lifecycle state of a pipeline. Only the controller changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_running(self) -> bool {
        self == PipelineState::Running
    }

    /// Stopped and Failed never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    /// Edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Draining)
                | (Draining, Stopped)
                | (Running, Failed)
                | (Draining, Failed)
        )
    }
}

/// Counters exposed for observability and test assertions.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub frames_captured: AtomicU64,
    pub capture_timeouts: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_converted: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub encode_failures: AtomicU64,
    /// Duplicate frames a sink wrote to cover timing gaps.
    pub frames_padded: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_timeouts: self.capture_timeouts.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_converted: self.frames_converted.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            frames_padded: self.frames_padded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub capture_timeouts: u64,
    pub frames_dropped: u64,
    pub frames_converted: u64,
    pub frames_encoded: u64,
    pub encode_failures: u64,
    pub frames_padded: u64,
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Graceful end. `output` is `None` only if no frame was ever encoded.
    Stopped {
        output: Option<PathBuf>,
        metrics: MetricsSnapshot,
    },
    /// Fatal end. Any encoded frames were still finalized into `output`.
    Failed {
        cause: PipelineError,
        output: Option<PathBuf>,
        metrics: MetricsSnapshot,
    },
}

impl PipelineOutcome {
    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineOutcome::Stopped { .. })
    }

    pub fn output(&self) -> Option<&PathBuf> {
        match self {
            PipelineOutcome::Stopped { output, .. } | PipelineOutcome::Failed { output, .. } => {
                output.as_ref()
            }
        }
    }

    pub fn metrics(&self) -> &MetricsSnapshot {
        match self {
            PipelineOutcome::Stopped { metrics, .. } | PipelineOutcome::Failed { metrics, .. } => {
                metrics
            }
        }
    }

    pub fn cause(&self) -> Option<&PipelineError> {
        match self {
            PipelineOutcome::Failed { cause, .. } => Some(cause),
            PipelineOutcome::Stopped { .. } => None,
        }
    }
}

/// The single authoritative state value, shared by controller and supervisor.
#[derive(Clone)]
struct StateCell(Arc<watch::Sender<PipelineState>>);

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(PipelineState::Idle);
        Self(Arc::new(tx))
    }

    fn get(&self) -> PipelineState {
        *self.0.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.0.subscribe()
    }

    /// Move to `next` if the edge is legal. Returns the state observed.
    fn transition(&self, next: PipelineState) -> Result<PipelineState, PipelineState> {
        let mut observed = PipelineState::Idle;
        let changed = self.0.send_if_modified(|current| {
            observed = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(from = ?observed, to = ?next, "pipeline state transition");
            Ok(observed)
        } else {
            Err(observed)
        }
    }
}

/// Headless capture-to-video pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    output: PathBuf,
    display: Option<Arc<dyn VirtualDisplay>>,
    opener: Option<Box<dyn SinkOpener>>,
    state: StateCell,
    metrics: Arc<PipelineMetrics>,
    queue: Option<Arc<FrameQueue>>,
    supervisor: Option<JoinHandle<PipelineOutcome>>,
    outcome: Option<PipelineOutcome>,
}

impl Pipeline {
    /// Create an idle pipeline writing to `output`.
    ///
    /// Fails with [`PipelineError::InvalidConfig`] if `config` is unusable.
    pub fn new(
        config: PipelineConfig,
        display: Arc<dyn VirtualDisplay>,
        opener: impl SinkOpener,
        output: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let output = output.into();
        let geometry = display.geometry();

        tracing::info!(
            %geometry,
            frame_rate = config.frame_rate,
            queue_capacity = config.queue_capacity,
            max_consecutive_failures = config.max_consecutive_failures,
            capture_timeout_ms = config.capture_timeout_ms,
            output = %output.display(),
            "capture pipeline created"
        );

        Ok(Self {
            config,
            output,
            display: Some(display),
            opener: Some(Box::new(opener)),
            state: StateCell::new(),
            metrics: Arc::new(PipelineMetrics::default()),
            queue: None,
            supervisor: None,
            outcome: None,
        })
    }

    /// Spawn the capture, encode, and supervisor tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.state
            .transition(PipelineState::Running)
            .map_err(|_| PipelineError::AlreadyRunning)?;

        let (Some(display), Some(opener)) = (self.display.take(), self.opener.take()) else {
            return Err(PipelineError::AlreadyRunning);
        };

        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));

        let source = FrameSource::new(
            display,
            Arc::clone(&queue),
            &self.config,
            Arc::clone(&self.metrics),
            self.state.subscribe(),
        );
        let encoder = EncoderPipeline::new(
            Arc::clone(&queue),
            opener,
            self.output.clone(),
            self.config.frame_rate,
            Arc::clone(&self.metrics),
        );

        let source_handle = tokio::spawn(source.run());
        let encoder_handle = tokio::spawn(encoder.run());

        self.supervisor = Some(tokio::spawn(supervise(
            self.state.clone(),
            Arc::clone(&queue),
            Arc::clone(&self.metrics),
            source_handle,
            encoder_handle,
        )));
        self.queue = Some(queue);

        tracing::info!("capture pipeline started");
        Ok(())
    }

    /// Ask the pipeline to drain and finalize. Idempotent and non-blocking.
    pub fn request_stop(&self) {
        if self.state.transition(PipelineState::Draining).is_ok() {
            tracing::info!("stopping capture pipeline");
            if let Some(queue) = &self.queue {
                queue.close();
            }
        }
    }

    /// Request a graceful stop and wait for the final outcome.
    ///
    /// Repeated calls return the same outcome; the output is finalized once.
    pub async fn stop(&mut self) -> Result<PipelineOutcome, PipelineError> {
        self.request_stop();
        self.wait().await
    }

    /// Wait for the pipeline to reach a terminal state without requesting a stop.
    pub async fn wait(&mut self) -> Result<PipelineOutcome, PipelineError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }

        let Some(handle) = self.supervisor.as_mut() else {
            return Err(PipelineError::NotStarted);
        };

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "pipeline supervisor aborted");
                let _ = self.state.transition(PipelineState::Failed);
                PipelineOutcome::Failed {
                    cause: PipelineError::TaskAborted(e.to_string()),
                    output: None,
                    metrics: self.metrics.snapshot(),
                }
            }
        };
        self.supervisor = None;
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Get the pipeline metrics.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Target output path.
    pub fn output(&self) -> &PathBuf {
        &self.output
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Detached tasks keep draining and finalize the output on their own.
        self.request_stop();
    }
}

/// Join both loops, apply the terminal transition, and build the outcome.
async fn supervise(
    state: StateCell,
    queue: Arc<FrameQueue>,
    metrics: Arc<PipelineMetrics>,
    mut source: JoinHandle<Result<u64, PipelineError>>,
    mut encoder: JoinHandle<EncoderReport>,
) -> PipelineOutcome {
    let mut cause: Option<PipelineError> = None;
    let mut source_done = false;

    let report = tokio::select! {
        result = &mut source => {
            source_done = true;
            if let Err(e) = flatten_source(result) {
                tracing::warn!(error = %e, "frame source failed, draining queued frames");
                cause = Some(e);
                let _ = state.transition(PipelineState::Draining);
            }
            join_encoder(encoder.await)
        }
        result = &mut encoder => join_encoder(result),
    };

    if let Some(e) = report.error {
        cause.get_or_insert(e);
    }

    if cause.is_some() {
        // Output is already finalized; let the producer see the failure.
        let _ = state.transition(PipelineState::Failed);
    }
    queue.close();

    if !source_done {
        if let Err(e) = flatten_source(source.await) {
            tracing::warn!(error = %e, "frame source failed after encoder exit");
            cause.get_or_insert(e);
        }
    }

    let snapshot = metrics.snapshot();

    match cause {
        Some(cause) => {
            let _ = state.transition(PipelineState::Failed);
            tracing::error!(
                error = %cause,
                output = ?report.output,
                frames_encoded = snapshot.frames_encoded,
                "capture pipeline failed"
            );
            PipelineOutcome::Failed {
                cause,
                output: report.output,
                metrics: snapshot,
            }
        }
        None => {
            let _ = state.transition(PipelineState::Draining);
            let _ = state.transition(PipelineState::Stopped);
            tracing::info!(
                output = ?report.output,
                frames_captured = snapshot.frames_captured,
                frames_encoded = snapshot.frames_encoded,
                frames_dropped = snapshot.frames_dropped,
                "capture pipeline stopped"
            );
            PipelineOutcome::Stopped {
                output: report.output,
                metrics: snapshot,
            }
        }
    }
}

fn flatten_source(
    result: Result<Result<u64, PipelineError>, tokio::task::JoinError>,
) -> Result<u64, PipelineError> {
    result.map_err(|e| PipelineError::TaskAborted(format!("frame source: {e}")))?
}

fn join_encoder(result: Result<EncoderReport, tokio::task::JoinError>) -> EncoderReport {
    result.unwrap_or_else(|e| EncoderReport {
        frames_encoded: 0,
        output: None,
        error: Some(PipelineError::TaskAborted(format!("encoder: {e}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(Draining.can_transition_to(Failed));
    }

    #[test]
    fn illegal_transitions() {
        use PipelineState::*;
        assert!(!Running.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Stopped));
        for terminal in [Stopped, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Running, Draining, Stopped, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn state_cell_rejects_illegal_edges() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        assert_eq!(cell.transition(PipelineState::Stopped), Err(PipelineState::Idle));
        assert!(!rx.has_changed().unwrap());

        assert_eq!(cell.transition(PipelineState::Running), Ok(PipelineState::Idle));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), PipelineState::Running);

        assert_eq!(cell.transition(PipelineState::Running), Err(PipelineState::Running));
        assert_eq!(cell.transition(PipelineState::Failed), Ok(PipelineState::Running));
        assert_eq!(cell.transition(PipelineState::Draining), Err(PipelineState::Failed));
        assert_eq!(cell.get(), PipelineState::Failed);
    }

    #[test]
    fn metrics_snapshot() {
        let m = PipelineMetrics::default();
        m.frames_captured.fetch_add(3, Ordering::Relaxed);
        m.frames_encoded.fetch_add(2, Ordering::Relaxed);
        m.capture_timeouts.fetch_add(1, Ordering::Relaxed);

        let snap = m.snapshot();
        assert_eq!(snap.frames_captured, 3);
        assert_eq!(snap.frames_encoded, 2);
        assert_eq!(snap.capture_timeouts, 1);
        assert_eq!(snap.frames_dropped, 0);
    }
}
