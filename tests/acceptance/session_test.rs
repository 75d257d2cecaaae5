//! Bounded detector sessions on the host clocks.
//!
//! # Acceptance Criteria
//!
//! - One status line per report, with one `fail:` counter per enabled source
//! - A single task runs alone and still reports
//! - `CLOCK_MONOTONIC` never warps while reads are serialized by the lock

use super::common::{averages, bounded_config, fail_counts, host_sources, status_lines};
use std::sync::atomic::AtomicBool;
use warp_common::config::{DetectorConfig, WorkerMode};
use warp_common::source::{SourceSet, TimeSource};
use warp_runtime::session::Session;

fn run(config: DetectorConfig) -> (warp_runtime::session::RunSummary, String) {
    let session = Session::new(config).expect("session setup");
    let shutdown = AtomicBool::new(false);
    let mut out = Vec::new();
    let summary = session.run(&shutdown, &mut out).expect("bounded run");
    (summary, String::from_utf8(out).expect("utf-8 status output"))
}

#[test]
fn test_thread_session_status_output() {
    let (summary, output) = run(bounded_config(4, WorkerMode::Thread, 50));

    assert_eq!(summary.tasks, 4);
    assert_eq!(summary.iterations, 50);
    assert_eq!(summary.reports, 50);

    let lines = status_lines(&output);
    assert_eq!(lines.len(), 50);

    let enabled = host_sources().iter().count();
    for line in &lines {
        assert_eq!(fail_counts(line).len(), enabled, "line: {line:?}");
        assert_eq!(averages(line).len(), enabled, "line: {line:?}");
    }

    // Warps are cumulative, so the last line bounds every earlier one and
    // is itself bounded by the final count
    let last = fail_counts(lines[lines.len() - 1]);
    for (reported, source) in last.iter().zip(&summary.sources) {
        assert!(*reported <= source.warps);
    }

    let clock = summary
        .sources
        .iter()
        .find(|s| s.source == TimeSource::Clock)
        .expect("CLOCK enabled");
    assert_eq!(clock.warps, 0);
    assert_eq!(clock.worst, 0);
    assert!(clock.samples >= 50 * 10);
}

#[test]
fn test_single_task_runs_alone_and_reports() {
    let (summary, output) = run(bounded_config(1, WorkerMode::Process, 30));

    assert_eq!(summary.tasks, 1);
    assert_eq!(summary.reports, 30);
    assert_eq!(status_lines(&output).len(), 30);

    // Exactly the reporter's own samples: nothing else was running
    for source in &summary.sources {
        assert_eq!(source.samples, 30 * 10, "{:?}", source.source);
    }
}

#[test]
fn test_wall_clock_rate_limit_suppresses_reports() {
    let config = DetectorConfig {
        report_every: 1,
        min_report_interval: std::time::Duration::from_secs(3600),
        ..bounded_config(1, WorkerMode::Thread, 100)
    };
    let (summary, output) = run(config);

    assert_eq!(summary.iterations, 100);
    assert_eq!(summary.reports, 0);
    assert!(output.is_empty());
}

#[test]
fn test_only_enabled_sources_reported() {
    let config = DetectorConfig {
        sources: SourceSet::none().with(TimeSource::Clock, true),
        ..bounded_config(2, WorkerMode::Thread, 5)
    };
    let session = Session::new(config).expect("session setup");

    let banner = session.banner();
    assert!(banner.contains(&format!("- {}\n", TimeSource::Clock.description())));
    assert!(!banner.contains(TimeSource::Tod.description()));

    let shutdown = AtomicBool::new(false);
    let mut out = Vec::new();
    let summary = session.run(&shutdown, &mut out).expect("bounded run");
    let output = String::from_utf8(out).expect("utf-8 status output");

    assert_eq!(summary.sources.len(), 1);
    for line in status_lines(&output) {
        assert!(line.starts_with(" | CLK: "), "line: {line:?}");
        assert_eq!(fail_counts(line).len(), 1);
    }
}
