//! The sampling loop.
//!
//! Each sample swaps the fresh reading into the shared `last` slot and
//! compares it with whatever the previous sampler (this worker or any other)
//! stored there. The read happens inside the critical section, so two
//! samples are always ordered the same way in time and in the table; a
//! smaller successor therefore means the source itself went backwards.

use crate::clock::Clock;
use crate::spinlock::LockOwner;
use crate::state::SharedState;
use std::fmt;
use std::io::Write;
use warp_common::error::WarpResult;
use warp_common::source::{SourceSet, TimeSource};

/// A backward step observed on one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpEvent {
    /// Source that went backwards.
    pub source: TimeSource,
    /// Value stored by the previous sampler (T0).
    pub previous: u64,
    /// Value just read (T1).
    pub current: u64,
    /// `T1 - T0`, always negative.
    pub delta: i64,
    /// Whether this warp is the largest seen so far on `source`.
    pub new_worst: bool,
}

impl fmt::Display for WarpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Units are padded to the width of "cycles,"
        let unit = format!("{},", self.source.unit());
        write!(
            f,
            "new {}-warp maximum: {:9} {:<7} {:016x} -> {:016x}",
            self.source, self.delta, unit, self.previous, self.current
        )
    }
}

/// Receives warps that set a new maximum.
pub trait WarpSink {
    /// Called once per new worst warp, after the lock is released.
    fn new_worst(&mut self, event: &WarpEvent);
}

/// Writes new maxima to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl WarpSink for StderrSink {
    fn new_worst(&mut self, event: &WarpEvent) {
        let mut stderr = std::io::stderr().lock();
        // Nothing sensible to do if stderr is gone
        let _ = writeln!(stderr, "\r{event}");
    }
}

impl WarpSink for Vec<WarpEvent> {
    fn new_worst(&mut self, event: &WarpEvent) {
        self.push(*event);
    }
}

/// One worker's view of the detector.
pub struct Detector<'a, C, S> {
    state: &'a SharedState,
    owner: LockOwner,
    clock: C,
    sink: S,
    sources: SourceSet,
    samples_per_source: u32,
}

impl<'a, C: Clock, S: WarpSink> Detector<'a, C, S> {
    /// Create a detector sampling `sources` into `state`.
    ///
    /// The table lock is taken on behalf of the process that calls this, so
    /// forked workers build their detector after the fork.
    pub fn new(
        state: &'a SharedState,
        clock: C,
        sink: S,
        sources: SourceSet,
        samples_per_source: u32,
    ) -> Self {
        Self {
            state,
            owner: LockOwner::current_process(),
            clock,
            sink,
            sources,
            samples_per_source,
        }
    }

    /// Take one sample of `source`.
    ///
    /// Returns the warp if the sample went backwards.
    ///
    /// # Errors
    ///
    /// Propagates a failed clock read. The lock is released first.
    pub fn sample(&mut self, source: TimeSource) -> WarpResult<Option<WarpEvent>> {
        let (previous, current) = {
            let mut table = self.state.lock_as(self.owner);
            let current = self.clock.read(source)?;
            (table.swap_last(source, current), current)
        };

        #[allow(clippy::cast_possible_wrap)]
        let delta = current.wrapping_sub(previous) as i64;

        let event = if delta < 0 {
            let new_worst = self.state.lock_as(self.owner).record_warp(source, delta);
            let event = WarpEvent {
                source,
                previous,
                current,
                delta,
                new_worst,
            };
            if new_worst {
                self.sink.new_worst(&event);
            }
            Some(event)
        } else {
            None
        };

        if source == TimeSource::Tsc && previous & 31 == 0 {
            std::hint::spin_loop();
        }

        Ok(event)
    }

    /// Run one loop iteration: a burst of samples per enabled source.
    ///
    /// Returns the number of warps observed.
    ///
    /// # Errors
    ///
    /// Propagates the first failed clock read.
    pub fn run_iteration(&mut self) -> WarpResult<u32> {
        let mut warps = 0;
        for source in TimeSource::ALL {
            if !self.sources.contains(source) {
                continue;
            }
            for _ in 0..self.samples_per_source {
                if self.sample(source)?.is_some() {
                    warps += 1;
                }
            }
        }
        Ok(warps)
    }

    /// Sink receiving new maxima.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}
