//! Pipeline runs through a real `ffmpeg` process.
//!
//! Skipped when no `ffmpeg` binary is on `PATH`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use headcap_media::config::PipelineConfig;
use headcap_media::ffmpeg::{self, FfmpegSinkOpener};
use headcap_media::pipeline::Pipeline;
use headcap_media::synthetic::SyntheticDisplay;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn ffmpeg_available() -> bool {
    match ffmpeg::probe_version(Path::new("ffmpeg")) {
        Ok(version) => {
            tracing::info!(%version, "using ffmpeg");
            true
        }
        Err(e) => {
            tracing::info!(error = %e, "ffmpeg not available, skipping");
            false
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn records_playable_mp4() {
    init_test_tracing();
    if !ffmpeg_available() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("capture.mp4");
    let config = PipelineConfig {
        frame_rate: 10,
        queue_capacity: 5,
        ..PipelineConfig::default()
    };
    let display = Arc::new(SyntheticDisplay::new(64, 48));
    let mut pipeline =
        Pipeline::new(config, display, FfmpegSinkOpener::default(), &output).unwrap();

    pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let outcome = pipeline.stop().await.unwrap();

    assert!(outcome.is_stopped(), "{outcome:?}");
    assert_eq!(outcome.output(), Some(&output));
    assert!(std::fs::metadata(&output).unwrap().len() > 0);

    let ffprobe = ffmpeg::ffprobe_for(Path::new("ffmpeg"));
    match ffmpeg::probe_duration(&ffprobe, &output) {
        Ok(duration) => assert!(
            duration >= Duration::from_millis(500) && duration <= Duration::from_millis(1600),
            "unexpected duration {duration:?}"
        ),
        Err(e) => tracing::info!(error = %e, "ffprobe not available"),
    }
}

#[tokio::test]
async fn unsupported_extension_fails_pipeline() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("capture.gif");
    let config = PipelineConfig {
        frame_rate: 20,
        ..PipelineConfig::default()
    };
    let display = Arc::new(SyntheticDisplay::new(16, 16));
    let mut pipeline =
        Pipeline::new(config, display, FfmpegSinkOpener::default(), &output).unwrap();
    pipeline.start().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.is_stopped());
    assert!(outcome.output().is_none());
    assert!(!output.exists());
}
