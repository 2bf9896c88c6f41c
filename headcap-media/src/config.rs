//! Pipeline configuration.
//!
//! Options come from the `[capture]` table of a TOML settings file or are
//! built in code. Unknown keys are rejected at parse time and every value is
//! validated before a pipeline can be constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Recognized pipeline options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Target capture rate in frames per second.
    pub frame_rate: u32,
    /// Frame queue capacity (C).
    pub queue_capacity: usize,
    /// Consecutive capture timeouts (K) before the source gives up.
    pub max_consecutive_failures: u32,
    /// Upper bound on a single display snapshot, in milliseconds.
    pub capture_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            queue_capacity: 8,
            max_consecutive_failures: 5,
            capture_timeout_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Parse a standalone TOML document of pipeline options.
    pub fn from_toml_str(contents: &str) -> Result<Self, PipelineError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option is usable.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.frame_rate == 0 {
            return Err(PipelineError::InvalidConfig(
                "frame_rate must be greater than zero".into(),
            ));
        }
        if self.frame_rate > 1000 {
            return Err(PipelineError::InvalidConfig(format!(
                "frame_rate {} exceeds 1000",
                self.frame_rate
            )));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_consecutive_failures must be greater than zero".into(),
            ));
        }
        if self.capture_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "capture_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Interval between capture ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate.max(1)))
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.capture_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config = PipelineConfig::from_toml_str("frame_rate = 10\nqueue_capacity = 5\n").unwrap();
        assert_eq!(config.frame_rate, 10);
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.frame_interval(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_unknown_option() {
        let err = PipelineConfig::from_toml_str("frame_rate = 10\ncrf = 23\n").unwrap_err();
        match err {
            PipelineError::InvalidConfig(msg) => assert!(msg.contains("crf"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_values() {
        for doc in [
            "frame_rate = 0",
            "queue_capacity = 0",
            "max_consecutive_failures = 0",
            "capture_timeout_ms = 0",
        ] {
            assert!(
                matches!(
                    PipelineConfig::from_toml_str(doc),
                    Err(PipelineError::InvalidConfig(_))
                ),
                "{doc} should be rejected"
            );
        }
    }
}
