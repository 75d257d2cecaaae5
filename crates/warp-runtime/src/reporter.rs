//! Periodic status line for the reporting worker.
//!
//! The reporter rate-limits itself twice: it only looks at the wall clock
//! every `report_every` iterations, and it only prints if at least
//! `min_report_interval` has passed since the previous line. Each report
//! drains the shared per-interval loop counters, so average µs/loop is
//! computed from the reporter's own running sums. Warp counts are not
//! drained and stay cumulative for the whole run.

use crate::state::SharedState;
use std::fmt;
use std::time::Duration;
use warp_common::error::WarpResult;
use warp_common::source::{SourceSet, TimeSource};

const SPINNER: [char; 4] = ['\\', '|', '/', '-'];

/// One source's entry in a status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceStatus {
    /// Source reported.
    pub source: TimeSource,
    /// Average wall-clock microseconds per sample, if any sample was counted.
    pub avg_us_per_loop: Option<f64>,
    /// Cumulative warp count.
    pub warps: u64,
}

/// A rendered status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    /// Entries for each enabled source, in sampling order.
    pub entries: Vec<SourceStatus>,
    /// Progress glyph.
    pub spinner: char,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match entry.avg_us_per_loop {
                Some(avg) => write!(
                    f,
                    " | {}: {avg:.2}us, fail:{}",
                    entry.source.status_label(),
                    entry.warps
                )?,
                None => write!(
                    f,
                    " | {}: n/a, fail:{}",
                    entry.source.status_label(),
                    entry.warps
                )?,
            }
        }
        write!(f, " {}", self.spinner)
    }
}

/// Local state of the reporting worker.
#[derive(Debug)]
pub struct StatusReporter {
    sources: SourceSet,
    report_every: u32,
    min_interval_us: u64,
    iterations: u32,
    prev_tod_us: u64,
    sum_tod_us: u64,
    sum_loops: [u64; TimeSource::COUNT],
    reports: u64,
}

impl StatusReporter {
    /// Create a reporter whose first interval starts at `now_tod_us`.
    #[must_use]
    pub fn new(
        sources: SourceSet,
        report_every: u32,
        min_report_interval: Duration,
        now_tod_us: u64,
    ) -> Self {
        Self {
            sources,
            report_every: report_every.max(1),
            min_interval_us: u64::try_from(min_report_interval.as_micros()).unwrap_or(u64::MAX),
            iterations: 0,
            prev_tod_us: now_tod_us,
            sum_tod_us: 0,
            sum_loops: [0; TimeSource::COUNT],
            reports: 0,
        }
    }

    /// Count one loop iteration and report if both rate limits allow.
    ///
    /// `now_tod_us` is only called when the iteration limit is reached.
    ///
    /// # Errors
    ///
    /// Propagates a failed wall-clock read.
    pub fn tick<F>(&mut self, state: &SharedState, now_tod_us: F) -> WarpResult<Option<StatusLine>>
    where
        F: FnOnce() -> WarpResult<u64>,
    {
        self.iterations += 1;
        if self.iterations < self.report_every {
            return Ok(None);
        }
        self.iterations = 0;

        let tod = now_tod_us()?;
        #[allow(clippy::cast_possible_wrap)]
        let elapsed = tod.wrapping_sub(self.prev_tod_us) as i64;
        if elapsed.unsigned_abs() < self.min_interval_us {
            return Ok(None);
        }

        let (loops, warps) = {
            let mut table = state.lock();
            (table.take_loops(), table.warps())
        };

        self.sum_tod_us = self.sum_tod_us.saturating_add_signed(elapsed);
        for (sum, window) in self.sum_loops.iter_mut().zip(loops) {
            *sum += window;
        }
        self.prev_tod_us = tod;
        self.reports += 1;

        #[allow(clippy::cast_precision_loss)]
        let entries = self
            .sources
            .iter()
            .map(|source| {
                let loops = self.sum_loops[source.index()];
                SourceStatus {
                    source,
                    avg_us_per_loop: (loops > 0).then(|| self.sum_tod_us as f64 / loops as f64),
                    warps: warps[source.index()],
                }
            })
            .collect();

        Ok(Some(StatusLine {
            entries,
            spinner: SPINNER[(self.reports & 3) as usize],
        }))
    }

    /// Number of status lines produced so far.
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// Loops counted into reports so far, per source.
    #[must_use]
    pub fn reported_loops(&self) -> [u64; TimeSource::COUNT] {
        self.sum_loops
    }
}
