//! Process-wide runtime settings.
//!
//! Loaded with figment from an optional `devctl.toml` and then from
//! `DEVCTL_`-prefixed environment variables, with `__` separating nested keys:
//!
//! ```text
//! DEVCTL_RETRY__MAX_ATTEMPTS=3
//! DEVCTL_ARBITER__ACQUIRE_TIMEOUT_MS=2000
//! DEVCTL_LOGGING__FORMAT=json
//! ```
//!
//! Every field has a default, so an empty environment and no file is valid.

use crate::arbiter::ArbiterSettings;
use crate::error::ConfigError;
use crate::motion::MotionSettings;
use crate::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DEVCTL_";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// Single-line.
    Compact,
    /// One JSON object per event.
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format on stderr.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// All runtime knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// `[retry]`
    pub retry: RetryPolicy,
    /// `[arbiter]`
    pub arbiter: ArbiterSettings,
    /// `[motion]`
    pub motion: MotionSettings,
    /// `[logging]`
    pub logging: LoggingSettings,
}

impl RuntimeSettings {
    /// Settings from `path` (if given) overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: RuntimeSettings = figment
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse {
                path: path.map(Path::to_path_buf).unwrap_or_default(),
                message: e.to_string(),
            })?;
        settings.validate(path)?;
        Ok(settings)
    }

    fn validate(&self, path: Option<&Path>) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: path.map(Path::to_path_buf).unwrap_or_default(),
            message,
        };
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(invalid(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.motion.poll_interval_ms == 0 {
            return Err(invalid("motion.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sources() {
        let settings = RuntimeSettings::load_with_prefix(None, "DEVCTL_TEST_EMPTY_").unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert_eq!(settings.retry.max_attempts, 10);
        assert_eq!(settings.motion.wait_timeout_ms, Some(300_000));
        assert_eq!(settings.arbiter.acquire_timeout_ms, None);
    }

    #[test]
    fn test_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devctl.toml");
        std::fs::write(
            &path,
            "[retry]\nmax_attempts = 4\n\n[arbiter]\nacquire_timeout_ms = 250\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();
        std::env::set_var("DEVCTL_TEST_LAYER_RETRY__MAX_ATTEMPTS", "2");

        let settings = RuntimeSettings::load_with_prefix(Some(&path), "DEVCTL_TEST_LAYER_").unwrap();
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.initial_delay_ms, 20);
        assert_eq!(settings.arbiter.acquire_timeout_ms, Some(250));
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_multiplier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devctl.toml");
        std::fs::write(&path, "[retry]\nbackoff_multiplier = 0.5\n").unwrap();
        let err = RuntimeSettings::load_with_prefix(Some(&path), "DEVCTL_TEST_BAD_").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
