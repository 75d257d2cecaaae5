//! Raw time-source readers.
//!
//! [`SystemClock`] reads the real hardware and kernel clocks. The detector is
//! generic over [`Clock`] so tests can feed it synthetic sample streams.

use tracing::debug;
use warp_common::error::{WarpError, WarpResult};
use warp_common::source::{SourceSet, TimeSource};

/// Something that yields samples for each time source.
pub trait Clock {
    /// Take one sample of `source` in its native unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    fn read(&mut self, source: TimeSource) -> WarpResult<u64>;
}

/// The host's real clocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn read(&mut self, source: TimeSource) -> WarpResult<u64> {
        match source {
            TimeSource::Tsc => read_tsc(),
            TimeSource::Tod => read_tod_us(),
            TimeSource::Clock => read_monotonic_ns(),
        }
    }
}

/// Read the time stamp counter behind a serializing `cpuid`.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn read_tsc() -> WarpResult<u64> {
    use std::arch::x86_64::{__cpuid, _rdtsc};

    // SAFETY: cpuid and rdtsc exist on every x86_64 processor. cpuid keeps
    // earlier instructions from being reordered past the counter read.
    #[allow(unused_unsafe)]
    let tsc = unsafe {
        let _ = __cpuid(0);
        _rdtsc()
    };
    Ok(tsc)
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn read_tsc() -> WarpResult<u64> {
    Err(WarpError::Unsupported(TimeSource::Tsc))
}

/// Wall-clock time of day in microseconds since the epoch.
#[inline]
pub fn read_tod_us() -> WarpResult<u64> {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // SAFETY: tv is a valid out-pointer and the timezone argument may be null.
    let ret = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(WarpError::Clock {
            clock: TimeSource::Tod,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    #[allow(clippy::cast_sign_loss)]
    let us = (tv.tv_sec as u64)
        .wrapping_mul(1_000_000)
        .wrapping_add(tv.tv_usec as u64);
    Ok(us)
}

/// `CLOCK_MONOTONIC` in nanoseconds.
#[inline]
pub fn read_monotonic_ns() -> WarpResult<u64> {
    use nix::time::{clock_gettime, ClockId};

    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(|e| WarpError::Clock {
        clock: TimeSource::Clock,
        reason: e.to_string(),
    })?;
    #[allow(clippy::cast_sign_loss)]
    let ns = (ts.tv_sec() as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec() as u64);
    Ok(ns)
}

/// Read every enabled source once so unsupported sources fail at startup
/// rather than inside a worker.
///
/// # Errors
///
/// Returns the first read failure.
pub fn probe(sources: SourceSet) -> WarpResult<()> {
    let mut clock = SystemClock;
    for source in sources.iter() {
        let sample = clock.read(source)?;
        debug!(%source, sample, "Time source available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_does_not_go_backwards_in_one_thread() {
        let a = read_monotonic_ns().unwrap();
        let b = read_monotonic_ns().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn test_tod_is_after_2001() {
        // 2001-09-09 in microseconds
        assert!(read_tod_us().unwrap() > 1_000_000_000 * 1_000_000);
    }

    #[test]
    fn test_units_agree() {
        let tod_us = read_tod_us().unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap();
        let diff = (now.as_micros() as i128 - i128::from(tod_us)).abs();
        assert!(diff < 5_000_000, "gettimeofday and SystemTime differ by {diff}us");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_tsc_advances() {
        let a = read_tsc().unwrap();
        let b = read_tsc().unwrap();
        assert!(b > a);
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[test]
    fn test_tsc_unsupported() {
        assert_eq!(read_tsc(), Err(WarpError::Unsupported(TimeSource::Tsc)));
    }

    #[test]
    fn test_probe_monotonic_and_tod() {
        let sources = SourceSet::none()
            .with(TimeSource::Tod, true)
            .with(TimeSource::Clock, true);
        assert!(probe(sources).is_ok());
    }
}
