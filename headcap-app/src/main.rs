mod cli;
pub mod settings;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use headcap_media::display::VirtualDisplay;
use headcap_media::ffmpeg::{self, FfmpegSinkOpener};
use headcap_media::synthetic::SyntheticDisplay;
use headcap_media::x11_display::X11Display;
use headcap_media::{Pipeline, PipelineConfig, PipelineOutcome};
use tracing_subscriber::EnvFilter;

use cli::CliArgs;
use settings::{EncoderKind, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "headcap failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<ExitCode> {
    let mut settings = match &args.config {
        Some(path) => Settings::load_from_file(path)?,
        None => Settings::load()?,
    };
    args.apply(&mut settings);

    if args.write_config {
        let path = args.config.clone().unwrap_or_else(Settings::default_path);
        settings.save_to_file(&path)?;
        println!("settings written to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    if args.check_ffmpeg {
        let version = ffmpeg_version(&settings.ffmpeg_path).await?;
        println!("{version}");
        return Ok(ExitCode::SUCCESS);
    }

    let display: Arc<dyn VirtualDisplay> = match args.synthetic {
        Some(size) => {
            tracing::info!(width = size.width, height = size.height, "recording synthetic test pattern");
            Arc::new(SyntheticDisplay::new(size.width, size.height))
        }
        None => {
            let name = settings.display.clone();
            let display = tokio::task::spawn_blocking(move || X11Display::connect(name.as_deref()))
                .await
                .context("display connect task failed")?
                .context("failed to open X display")?;
            Arc::new(display)
        }
    };

    let mut pipeline = build_pipeline(&settings, display).await?;

    tracing::info!(
        output = %settings.output.display(),
        encoder = ?settings.encoder,
        duration_secs = ?settings.duration_secs,
        "recording started, press Ctrl-C to stop"
    );
    pipeline.start()?;

    let mut state = pipeline.subscribe();
    let time_limit = async {
        match settings.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = time_limit => tracing::info!("duration reached"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("shutdown signal received, stopping recorder"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C, stopping recorder"),
        },
        _ = state.wait_for(|s| s.is_terminal()) => {}
    }

    let outcome = pipeline.stop().await?;
    report(&outcome, &settings).await;

    Ok(if outcome.is_stopped() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn build_pipeline(
    settings: &Settings,
    display: Arc<dyn VirtualDisplay>,
) -> Result<Pipeline> {
    let config = settings.capture.clone();
    let output = settings.output.clone();

    match settings.encoder {
        EncoderKind::Ffmpeg => {
            let version = ffmpeg_version(&settings.ffmpeg_path).await?;
            tracing::info!(%version, "using ffmpeg");
            let opener = FfmpegSinkOpener::new(&settings.ffmpeg_path);
            Ok(Pipeline::new(config, display, opener, output)?)
        }
        EncoderKind::H264 => h264_pipeline(config, display, output),
    }
}

/// Run `ffmpeg -version` on the blocking pool.
async fn ffmpeg_version(ffmpeg_path: &Path) -> Result<String> {
    let path = ffmpeg_path.to_path_buf();
    tokio::task::spawn_blocking(move || ffmpeg::probe_version(&path))
        .await
        .context("ffmpeg probe task failed")?
        .context("ffmpeg was not found; install it or set ffmpeg_path")
}

#[cfg(feature = "video-codec")]
fn h264_pipeline(
    config: PipelineConfig,
    display: Arc<dyn VirtualDisplay>,
    output: PathBuf,
) -> Result<Pipeline> {
    let opener = headcap_media::h264_sink::H264SinkOpener::default();
    Ok(Pipeline::new(config, display, opener, output)?)
}

#[cfg(not(feature = "video-codec"))]
fn h264_pipeline(
    _config: PipelineConfig,
    _display: Arc<dyn VirtualDisplay>,
    _output: PathBuf,
) -> Result<Pipeline> {
    anyhow::bail!("the h264 encoder requires building with the `video-codec` feature")
}

async fn report(outcome: &PipelineOutcome, settings: &Settings) {
    let metrics = outcome.metrics();
    match outcome {
        PipelineOutcome::Stopped { .. } => println!("recording stopped"),
        PipelineOutcome::Failed { cause, .. } => println!("recording failed: {cause}"),
    }
    println!(
        "frames: {} captured, {} encoded, {} dropped, {} padded, {} capture timeouts, {} encode failures",
        metrics.frames_captured,
        metrics.frames_encoded,
        metrics.frames_dropped,
        metrics.frames_padded,
        metrics.capture_timeouts,
        metrics.encode_failures,
    );

    let Some(output) = outcome.output().cloned() else {
        println!("no output written");
        return;
    };
    println!("output: {}", output.display());

    if settings.encoder == EncoderKind::Ffmpeg {
        let ffprobe = ffmpeg::ffprobe_for(&settings.ffmpeg_path);
        match tokio::task::spawn_blocking(move || ffmpeg::probe_duration(&ffprobe, &output)).await {
            Ok(Ok(duration)) => println!("duration: {:.2}s", duration.as_secs_f64()),
            Ok(Err(e)) => tracing::debug!(error = %format!("{e:#}"), "could not probe output duration"),
            Err(e) => tracing::debug!(error = %e, "duration probe task failed"),
        }
    }
}
