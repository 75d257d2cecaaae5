//! Time sources sampled by the detector.
//!
//! Each source has its own resolution and its own class of warp:
//! - TSC: per-core cycle counter, warps expose cross-core desynchronization
//! - TOD: wall-clock time of day, warps are expected under clock adjustment
//! - CLOCK: `CLOCK_MONOTONIC`, any warp is an OS or hypervisor bug

use serde::{Deserialize, Serialize};
use std::fmt;

/// A time source the detector can sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    /// Processor time stamp counter (cycle resolution).
    Tsc,
    /// `gettimeofday` wall clock (microsecond resolution).
    Tod,
    /// `clock_gettime(CLOCK_MONOTONIC)` (nanosecond resolution).
    Clock,
}

impl TimeSource {
    /// Number of distinct sources.
    pub const COUNT: usize = 3;

    /// All sources in sampling order.
    pub const ALL: [TimeSource; Self::COUNT] = [Self::Tsc, Self::Tod, Self::Clock];

    /// Slot index of this source in per-source tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Tsc => 0,
            Self::Tod => 1,
            Self::Clock => 2,
        }
    }

    /// Short label used in the periodic status line.
    #[must_use]
    pub const fn status_label(self) -> &'static str {
        match self {
            Self::Tsc => "TSC",
            Self::Tod => "TOD",
            Self::Clock => "CLK",
        }
    }

    /// Unit of a raw sample delta.
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Tsc => "cycles",
            Self::Tod => "usecs",
            Self::Clock => "nsecs",
        }
    }

    /// One-line description printed in the startup banner.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Tsc => "read time stamp counter (RDTSC) instruction (cycle resolution)",
            Self::Tod => "gettimeofday (TOD) syscall (usec resolution)",
            Self::Clock => "clock_gettime(CLOCK_MONOTONIC) syscall (nsec resolution)",
        }
    }
}

impl fmt::Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tsc => write!(f, "TSC"),
            Self::Tod => write!(f, "TOD"),
            Self::Clock => write!(f, "CLOCK"),
        }
    }
}

/// Set of enabled time sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSet {
    /// Sample the time stamp counter.
    pub tsc: bool,
    /// Sample the wall clock.
    pub tod: bool,
    /// Sample the monotonic clock.
    pub clock: bool,
}

impl Default for SourceSet {
    fn default() -> Self {
        Self::all()
    }
}

impl SourceSet {
    /// Every source enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            tsc: true,
            tod: true,
            clock: true,
        }
    }

    /// No source enabled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            tsc: false,
            tod: false,
            clock: false,
        }
    }

    /// Check whether `source` is enabled.
    #[must_use]
    pub const fn contains(&self, source: TimeSource) -> bool {
        match source {
            TimeSource::Tsc => self.tsc,
            TimeSource::Tod => self.tod,
            TimeSource::Clock => self.clock,
        }
    }

    /// Enable or disable `source`.
    pub fn set(&mut self, source: TimeSource, enabled: bool) {
        match source {
            TimeSource::Tsc => self.tsc = enabled,
            TimeSource::Tod => self.tod = enabled,
            TimeSource::Clock => self.clock = enabled,
        }
    }

    /// Builder-style variant of [`SourceSet::set`].
    #[must_use]
    pub fn with(mut self, source: TimeSource, enabled: bool) -> Self {
        self.set(source, enabled);
        self
    }

    /// `true` if no source is enabled.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.tsc || self.tod || self.clock)
    }

    /// Iterate over enabled sources in sampling order.
    pub fn iter(&self) -> impl Iterator<Item = TimeSource> + '_ {
        TimeSource::ALL.into_iter().filter(|s| self.contains(*s))
    }
}
