//! CPU discovery and worker pinning.
//!
//! Warps between cores only show up when samplers actually run on
//! different cores, so workers can optionally be pinned round-robin over
//! the online CPUs.

use tracing::warn;
use warp_common::error::WarpResult;

/// Number of online logical processors.
pub fn online_cpus() -> usize {
    // SAFETY: sysconf is safe to call
    #[cfg(unix)]
    {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if let Ok(n) = usize::try_from(n) {
            if n > 0 {
                return n;
            }
        }
    }

    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// CPU that worker `index` should run on.
#[must_use]
pub fn cpu_for_worker(index: usize, cpus: usize) -> usize {
    index % cpus.max(1)
}

/// Pin the calling thread to `cpu`.
///
/// Returns `Ok(false)` when the CPU does not exist in the allowed set.
///
/// # Errors
///
/// Returns an error if the affinity call fails for any other reason.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> WarpResult<bool> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;
    use tracing::debug;
    use warp_common::error::WarpError;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .map_err(|e| WarpError::Affinity(format!("Invalid CPU index {cpu}: {e}")))?;

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            debug!(cpu, "Worker pinned");
            Ok(true)
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(cpu, "Invalid CPU set - CPU may be offline or outside the cpuset");
            Ok(false)
        }
        Err(e) => Err(WarpError::Affinity(format!("sched_setaffinity failed: {e}"))),
    }
}

/// Pinning is not supported here; always `Ok(false)`.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> WarpResult<bool> {
    warn!(cpu, "CPU affinity not available on this platform");
    Ok(false)
}
