//! Recorder settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/headcap/settings.toml`.
//! A missing file yields defaults; a malformed file or an unknown key is an
//! error so typos never silently fall back to defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use headcap_media::PipelineConfig;
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "settings.toml";

/// User-configurable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// X display to record (e.g. `:99`). Falls back to `$DISPLAY`.
    pub display: Option<String>,
    /// Output media file. The extension selects the container.
    pub output: PathBuf,
    /// ffmpeg executable used by the ffmpeg encoder.
    pub ffmpeg_path: PathBuf,
    /// Encoder backend.
    pub encoder: EncoderKind,
    /// Stop after this many seconds. Records until interrupted when unset.
    pub duration_secs: Option<u64>,
    /// Capture pipeline options.
    pub capture: PipelineConfig,
}

/// Encoder backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Pipe raw frames into an ffmpeg child process.
    Ffmpeg,
    /// Write a raw H.264 stream with OpenH264.
    H264,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display: None,
            output: PathBuf::from("capture.mp4"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            encoder: EncoderKind::Ffmpeg,
            duration_secs: None,
            capture: PipelineConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&Self::config_dir())
    }

    /// Load settings from `<config_dir>/settings.toml`.
    pub fn load_from_dir(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, using defaults"
                );
                Ok(Self::default())
            }
            Err(e) => Err(e)
                .with_context(|| format!("failed to read settings file: {}", path.display())),
        }
    }

    /// Load settings from an explicit file, which must exist.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let settings: Self = toml::from_str(contents)
            .with_context(|| format!("invalid settings file: {}", path.display()))?;
        settings
            .capture
            .validate()
            .with_context(|| format!("invalid [capture] options in {}", path.display()))?;
        tracing::info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Write settings to `path`, creating its directory if needed.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("failed to create config directory: {}", dir.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Default settings file location.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join(SETTINGS_FILE)
    }

    /// Get the default config directory.
    fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "headcap")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("headcap-config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn default_settings_are_valid() {
        init_test_tracing();
        let settings = Settings::default();
        assert_eq!(settings.encoder, EncoderKind::Ffmpeg);
        assert_eq!(settings.output, PathBuf::from("capture.mp4"));
        assert!(settings.duration_secs.is_none());
        assert!(settings.capture.validate().is_ok());
    }

    #[test]
    fn save_and_load_roundtrip() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();

        let settings = Settings {
            display: Some(":99".to_string()),
            output: PathBuf::from("/tmp/session.webm"),
            ffmpeg_path: PathBuf::from("/opt/ffmpeg/bin/ffmpeg"),
            encoder: EncoderKind::H264,
            duration_secs: Some(30),
            capture: PipelineConfig {
                frame_rate: 15,
                queue_capacity: 4,
                ..PipelineConfig::default()
            },
        };

        settings
            .save_to_file(&tmp.path().join("nested").join(SETTINGS_FILE))
            .unwrap();
        let loaded = Settings::load_from_dir(&tmp.path().join("nested")).unwrap();

        assert_eq!(settings, loaded);
    }

    #[test]
    fn missing_config_returns_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();

        let loaded = Settings::load_from_dir(&tmp.path().join("nonexistent")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        assert!(Settings::load_from_file(&tmp.path().join("absent.toml")).is_err());
    }

    #[test]
    fn corrupted_config_is_an_error() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "{{{{not valid toml}}}}").unwrap();

        let err = Settings::load_from_dir(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid settings file"), "{err:#}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");

        std::fs::write(&path, "ouptut = \"x.mp4\"\n").unwrap();
        assert!(Settings::load_from_file(&path).is_err());

        std::fs::write(&path, "[capture]\nframe_rate = 10\ncrf = 23\n").unwrap();
        assert!(Settings::load_from_file(&path).is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(
            &path,
            "display = \":42\"\nencoder = \"h264\"\n\n[capture]\nframe_rate = 12\n",
        )
        .unwrap();

        let loaded = Settings::load_from_file(&path).unwrap();
        assert_eq!(loaded.display.as_deref(), Some(":42"));
        assert_eq!(loaded.encoder, EncoderKind::H264);
        assert_eq!(loaded.capture.frame_rate, 12);
        assert_eq!(loaded.capture.queue_capacity, 8);
        assert_eq!(loaded.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn invalid_capture_values_are_rejected() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "[capture]\nqueue_capacity = 0\n").unwrap();

        let err = Settings::load_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("queue_capacity"), "{err:#}");
    }
}
