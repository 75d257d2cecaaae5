//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Building bounded detector configurations that run on any host
//! - Parsing status output the way external harnesses do

#![allow(dead_code)] // Not every helper is used by every test file

use std::num::NonZeroUsize;
use std::time::Duration;
use warp_common::config::{DetectorConfig, WorkerMode};
use warp_common::source::{SourceSet, TimeSource};

/// Sources readable on this host. The TSC only exists on x86_64.
pub fn host_sources() -> SourceSet {
    SourceSet::all().with(TimeSource::Tsc, cfg!(target_arch = "x86_64"))
}

/// A configuration that reports on every iteration and stops after
/// `iterations`.
pub fn bounded_config(tasks: usize, mode: WorkerMode, iterations: u64) -> DetectorConfig {
    DetectorConfig {
        tasks: NonZeroUsize::new(tasks),
        worker_mode: mode,
        sources: host_sources(),
        report_every: 1,
        min_report_interval: Duration::ZERO,
        max_iterations: iterations,
        ..DetectorConfig::default()
    }
}

/// Split captured stdout into status lines.
///
/// Status lines are terminated by `\r`, so a terminal redraws them in
/// place; anything after the final `\r` is not a complete line.
pub fn status_lines(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.split('\r').collect();
    lines.pop();
    lines
        .into_iter()
        .map(|segment| segment.rsplit('\n').next().unwrap_or(segment))
        .filter(|line| line.starts_with(" | "))
        .collect()
}

/// Extract the `fail:<n>` counters from one status line, in order.
pub fn fail_counts(line: &str) -> Vec<u64> {
    line.split("fail:")
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Extract the average microseconds per loop of each entry.
///
/// `None` for entries rendered as `n/a`.
pub fn averages(line: &str) -> Vec<Option<f64>> {
    line.split(" | ")
        .skip(1)
        .map(|entry| {
            let value = entry.split_once(": ")?.1.split_once("us,")?.0;
            value.parse().ok()
        })
        .collect()
}

#[test]
fn test_parse_status_line() {
    let line = " | TSC: 2.50us, fail:0 | TOD: n/a, fail:12 | CLK: 0.10us, fail:3 /";
    assert_eq!(fail_counts(line), vec![0, 12, 3]);
    assert_eq!(averages(line), vec![Some(2.5), None, Some(0.1)]);
}

#[test]
fn test_status_lines_drop_incomplete_tail() {
    let output = "banner\n\n | TOD: 1.00us, fail:0 |\r | TOD: 1.00us, fail:0 /\r | TOD";
    assert_eq!(status_lines(output).len(), 2);
}
