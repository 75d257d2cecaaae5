//! Configuration structures for the time-warp detector.
//!
//! Supports TOML deserialization with defaults matching the classic
//! `time-warp-test` behaviour: all three sources, ten samples per source,
//! a status line every 1000 iterations at most every 100ms.

use crate::error::WarpError;
use crate::source::SourceSet;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of parallel workers (`None` = one per online CPU).
    pub tasks: Option<NonZeroUsize>,

    /// How workers are launched.
    pub worker_mode: WorkerMode,

    /// Enabled time sources.
    pub sources: SourceSet,

    /// Consecutive samples of each source per loop iteration.
    pub samples_per_source: u32,

    /// Reporter checks the wall clock every this many iterations.
    pub report_every: u32,

    /// Minimum wall time between two status lines.
    #[serde(with = "humantime_serde")]
    pub min_report_interval: Duration,

    /// Pin worker `i` to CPU `i % cpus`.
    pub pin_workers: bool,

    /// Stop after this much wall time (`None` = run until killed).
    #[serde(with = "humantime_serde::option")]
    pub duration: Option<Duration>,

    /// Stop after this many reporter iterations (0 = infinite).
    pub max_iterations: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tasks: None,
            worker_mode: WorkerMode::Process,
            sources: SourceSet::all(),
            samples_per_source: 10,
            report_every: 1000,
            min_report_interval: Duration::from_millis(100),
            pin_workers: false,
            duration: None,
            max_iterations: 0,
        }
    }
}

/// Worker launch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One forked OS process per worker (fault-isolated, exposes real
    /// cross-core behaviour).
    #[default]
    Process,
    /// One thread per worker inside a single process.
    Thread,
}

impl DetectorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check that the configuration describes a runnable detector.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one time source must be enabled".into(),
            ));
        }
        if self.samples_per_source == 0 {
            return Err(ConfigError::Invalid(
                "samples_per_source must be positive".into(),
            ));
        }
        if self.report_every == 0 {
            return Err(ConfigError::Invalid("report_every must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for WarpError {
    fn from(err: ConfigError) -> Self {
        WarpError::Config(err.to_string())
    }
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Same format for optional durations; `None` is omitted on output.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
