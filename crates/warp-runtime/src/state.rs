//! State shared by every worker.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ SpinLock<WarpTable>                       (cache padded) │
//! │   owner: AtomicU32 (holder pid, 0 = free)                │
//! │   [TSC]   last │ worst │ loops │ warps                   │
//! │   [TOD]   last │ worst │ loops │ warps                   │
//! │   [CLOCK] last │ worst │ loops │ warps                   │
//! ├──────────────────────────────────────────────────────────┤
//! │ stop: AtomicBool                          (cache padded) │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every field of the table is read and written only through the lock
//! guard. The stop flag is outside the lock so workers can poll it without
//! contending with samplers.

use crate::shared::SHARED_PAGE_SIZE;
use crate::spinlock::{LockOwner, SpinLock, SpinLockGuard};
use crossbeam_utils::CachePadded;
use serde::Serialize;
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, Ordering};
use warp_common::source::TimeSource;

/// Per-source counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounters {
    /// Most recent sample stored by any worker.
    pub last: u64,
    /// Most negative delta ever observed (0 until the first warp).
    pub worst: i64,
    /// Samples taken since the last status report.
    pub loops: u64,
    /// Warps detected since startup.
    pub warps: u64,
}

/// Table of counters for all sources. Only reachable through the lock.
#[repr(C)]
#[derive(Debug, Default)]
pub struct WarpTable {
    sources: [SourceCounters; TimeSource::COUNT],
}

impl WarpTable {
    /// Counters for `source`.
    #[inline]
    #[must_use]
    pub fn counters(&self, source: TimeSource) -> &SourceCounters {
        &self.sources[source.index()]
    }

    /// Store `sample` as the newest value of `source` and count one loop.
    ///
    /// Returns the value it replaced.
    #[inline]
    pub fn swap_last(&mut self, source: TimeSource, sample: u64) -> u64 {
        let slot = &mut self.sources[source.index()];
        let previous = std::mem::replace(&mut slot.last, sample);
        slot.loops += 1;
        previous
    }

    /// Count one warp of `delta` on `source`.
    ///
    /// Returns `true` if `delta` is strictly worse than every earlier warp.
    #[inline]
    pub fn record_warp(&mut self, source: TimeSource, delta: i64) -> bool {
        let slot = &mut self.sources[source.index()];
        slot.warps += 1;
        if delta < slot.worst {
            slot.worst = delta;
            true
        } else {
            false
        }
    }

    /// Read and zero every windowed loop counter.
    pub fn take_loops(&mut self) -> [u64; TimeSource::COUNT] {
        let mut loops = [0; TimeSource::COUNT];
        for (out, slot) in loops.iter_mut().zip(self.sources.iter_mut()) {
            *out = std::mem::take(&mut slot.loops);
        }
        loops
    }

    /// Cumulative warp counts.
    #[must_use]
    pub fn warps(&self) -> [u64; TimeSource::COUNT] {
        self.sources.map(|s| s.warps)
    }

    /// Copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> [SourceCounters; TimeSource::COUNT] {
        self.sources
    }
}

/// The block placed in shared memory.
#[repr(C)]
#[derive(Default)]
pub struct SharedState {
    table: CachePadded<SpinLock<WarpTable>>,
    stop: CachePadded<AtomicBool>,
}

const_assert!(std::mem::size_of::<SharedState>() <= SHARED_PAGE_SIZE);

impl SharedState {
    /// Fresh state: all counters zero, not stopped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the table lock on behalf of the calling process.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, WarpTable> {
        self.table.lock(LockOwner::current_process())
    }

    /// Acquire the table lock as `owner`. Sampling loops resolve their tag
    /// once and come through here.
    #[inline]
    pub fn lock_as(&self, owner: LockOwner) -> SpinLockGuard<'_, WarpTable> {
        self.table.lock(owner)
    }

    /// Try to acquire the table lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, WarpTable>> {
        self.table.try_lock(LockOwner::current_process())
    }

    /// Release the table lock if the exited process `dead` still holds it.
    ///
    /// The counters it was updating keep whatever it had written.
    pub fn release_abandoned(&self, dead: LockOwner) -> bool {
        self.table.release_abandoned(dead)
    }

    /// Ask every worker to leave its loop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Check whether workers should leave their loop.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Consistent copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> [SourceCounters; TimeSource::COUNT] {
        self.lock().snapshot()
    }
}
