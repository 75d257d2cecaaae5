//! Shared-state invariants under real contention.
//!
//! Many threads sample through one [`SharedState`] placed in a shared
//! mapping, exactly as forked workers would, using synthetic clocks whose
//! correct output is known.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use warp_common::error::WarpResult;
use warp_common::source::{SourceSet, TimeSource};
use warp_runtime::clock::{Clock, SystemClock};
use warp_runtime::detector::{Detector, WarpEvent};
use warp_runtime::shared::SharedRegion;
use warp_runtime::state::SharedState;

const THREADS: usize = 8;
const ITERATIONS: u64 = 2_000;

/// A clock shared by every thread that only ever moves forward, unless one
/// read is told to jump back.
struct GlobalCounter<'a> {
    counter: &'a AtomicU64,
    reads: u64,
    jump_back_at: Option<u64>,
}

impl<'a> GlobalCounter<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        Self {
            counter,
            reads: 0,
            jump_back_at: None,
        }
    }
}

impl Clock for GlobalCounter<'_> {
    fn read(&mut self, _source: TimeSource) -> WarpResult<u64> {
        self.reads += 1;
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.jump_back_at == Some(self.reads) {
            Ok(value - 1000)
        } else {
            Ok(value)
        }
    }
}

fn tod_only() -> SourceSet {
    SourceSet::none().with(TimeSource::Tod, true)
}

#[test]
fn test_forward_clock_never_warps_under_contention() {
    let state = SharedRegion::new(SharedState::new()).expect("shared mapping");
    let counter = AtomicU64::new(1_000_000);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mut detector = Detector::new(
                    &state,
                    GlobalCounter::new(&counter),
                    Vec::<WarpEvent>::new(),
                    tod_only(),
                    1,
                );
                for _ in 0..ITERATIONS {
                    assert_eq!(detector.run_iteration().unwrap(), 0);
                }
            });
        }
    });

    let counters = *state.lock().counters(TimeSource::Tod);
    assert_eq!(counters.warps, 0);
    assert_eq!(counters.loops, THREADS as u64 * ITERATIONS);
    assert_eq!(counters.last, counter.load(Ordering::Relaxed));
}

#[test]
fn test_single_injected_jump_counted_once() {
    let state = SharedRegion::new(SharedState::new()).expect("shared mapping");
    let counter = AtomicU64::new(1_000_000);

    let events: Vec<WarpEvent> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|index| {
                let state = &state;
                let counter = &counter;
                s.spawn(move || {
                    let mut clock = GlobalCounter::new(counter);
                    if index == 0 {
                        clock.jump_back_at = Some(ITERATIONS / 2);
                    }
                    let mut detector = Detector::new(state, clock, Vec::new(), tod_only(), 1);
                    for _ in 0..ITERATIONS {
                        detector.run_iteration().unwrap();
                    }
                    detector.sink().clone()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let counters = *state.lock().counters(TimeSource::Tod);
    assert_eq!(counters.warps, 1);
    assert_eq!(counters.worst, -999);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].delta, -999);
    assert!(events[0].new_worst);
}

#[test]
fn test_monotonic_clock_never_warps_across_threads() {
    let state = SharedRegion::new(SharedState::new()).expect("shared mapping");
    let sources = SourceSet::none().with(TimeSource::Clock, true);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut detector = Detector::new(&state, SystemClock, Vec::new(), sources, 10);
                for _ in 0..ITERATIONS {
                    detector.run_iteration().unwrap();
                }
            });
        }
    });

    let counters = *state.lock().counters(TimeSource::Clock);
    assert_eq!(counters.warps, 0);
    assert_eq!(counters.loops, 4 * ITERATIONS * 10);
}
