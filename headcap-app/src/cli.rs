use std::path::PathBuf;

use clap::Parser;

use crate::settings::{EncoderKind, Settings};

/// Record a headless X display to a video file.
#[derive(Parser, Debug)]
#[command(name = "headcap", author, version, about, long_about = None)]
pub struct CliArgs {
    /// Settings file to use instead of the default location
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// X display to record, e.g. ":99"
    #[arg(short, long, value_name = "DISPLAY")]
    pub display: Option<String>,

    /// Output file; the extension picks the container
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short = 't', long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Capture frame rate
    #[arg(long, value_name = "N")]
    pub fps: Option<u32>,

    /// Encoder backend
    #[arg(long, value_enum)]
    pub encoder: Option<EncoderKind>,

    /// Record a generated test pattern of this size instead of an X display
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub synthetic: Option<FrameSize>,

    /// Check that ffmpeg is installed, print its version, and exit
    #[arg(long)]
    pub check_ffmpeg: bool,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    pub write_config: bool,
}

/// Width and height given as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

fn parse_size(s: &str) -> Result<FrameSize, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
    let width: u32 = w.trim().parse().map_err(|_| format!("invalid width {w:?}"))?;
    let height: u32 = h.trim().parse().map_err(|_| format!("invalid height {h:?}"))?;
    if width == 0 || height == 0 {
        return Err("width and height must be non-zero".into());
    }
    Ok(FrameSize { width, height })
}

impl CliArgs {
    /// Overlay command-line flags on top of file settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(display) = &self.display {
            settings.display = Some(display.clone());
        }
        if let Some(output) = &self.output {
            settings.output = output.clone();
        }
        if let Some(duration) = self.duration {
            settings.duration_secs = Some(duration);
        }
        if let Some(fps) = self.fps {
            settings.capture.frame_rate = fps;
        }
        if let Some(encoder) = self.encoder {
            settings.encoder = encoder;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let args = CliArgs::try_parse_from([
            "headcap",
            "--display",
            ":7",
            "-o",
            "run.webm",
            "-t",
            "5",
            "--fps",
            "12",
            "--encoder",
            "h264",
        ])
        .unwrap();

        let mut settings = Settings {
            display: Some(":1".into()),
            ..Settings::default()
        };
        args.apply(&mut settings);

        assert_eq!(settings.display.as_deref(), Some(":7"));
        assert_eq!(settings.output, PathBuf::from("run.webm"));
        assert_eq!(settings.duration_secs, Some(5));
        assert_eq!(settings.capture.frame_rate, 12);
        assert_eq!(settings.encoder, EncoderKind::H264);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let args = CliArgs::try_parse_from(["headcap"]).unwrap();
        let mut settings = Settings {
            duration_secs: Some(60),
            ..Settings::default()
        };
        args.apply(&mut settings);
        assert_eq!(settings.duration_secs, Some(60));
        assert_eq!(settings.encoder, EncoderKind::Ffmpeg);
        assert!(!args.check_ffmpeg);
    }

    #[test]
    fn synthetic_size_parsing() {
        let args = CliArgs::try_parse_from(["headcap", "--synthetic", "640x480"]).unwrap();
        assert_eq!(
            args.synthetic,
            Some(FrameSize {
                width: 640,
                height: 480
            })
        );

        assert!(CliArgs::try_parse_from(["headcap", "--synthetic", "640"]).is_err());
        assert!(CliArgs::try_parse_from(["headcap", "--synthetic", "0x480"]).is_err());
        assert!(CliArgs::try_parse_from(["headcap", "--encoder", "vp8"]).is_err());
    }
}
