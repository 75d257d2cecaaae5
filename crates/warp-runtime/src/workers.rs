//! Worker topology.
//!
//! The launcher forks every sibling itself and keeps the pids, so it can
//! stop and reap them. All workers run the same loop; the one whose pid is
//! the launcher's also prints status.
//!
//! Children never die from SIGINT or SIGTERM: a child killed inside the
//! table lock would leave it held. They leave their loop when the launcher
//! raises the shared stop flag, and the kernel kills them with SIGKILL if
//! the launcher goes away first.

use nix::sys::signal::{kill, pthread_sigmask, signal, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::num::NonZeroUsize;
use tracing::{debug, error, info, warn};
use warp_common::error::{WarpError, WarpResult};

/// Signals that stop the launcher and that children ignore.
const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// What a worker does besides sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Samples and prints periodic status.
    Reporter,
    /// Only samples.
    Sampler,
}

impl WorkerRole {
    /// Role of the process `me` in a tree launched by `launcher`.
    #[must_use]
    pub fn of(me: Pid, launcher: Pid) -> Self {
        if me == launcher {
            Self::Reporter
        } else {
            Self::Sampler
        }
    }
}

/// A child collected by [`ProcessWorkers::try_reap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Pid of the child.
    pub pid: Pid,
    /// Why it failed, or `None` for a zero exit status.
    pub failure: Option<String>,
}

/// Forked sampler processes owned by the launcher.
#[derive(Debug)]
pub struct ProcessWorkers {
    launcher: Pid,
    children: Vec<Pid>,
}

impl ProcessWorkers {
    /// Fork `count - 1` children.
    ///
    /// Child `i` (1-based) runs `body(i)` and exits with its return value;
    /// it never returns into the caller. The launcher gets the handle back.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::Spawn`] if a fork fails. Children already
    /// forked are killed and reaped first.
    pub fn spawn<F>(count: NonZeroUsize, body: F) -> WarpResult<Self>
    where
        F: Fn(usize) -> i32,
    {
        let launcher = getpid();
        let mut workers = Self {
            launcher,
            children: Vec::with_capacity(count.get() - 1),
        };
        if count.get() == 1 {
            return Ok(workers);
        }

        // Held back until each child has switched them to SIG_IGN
        let mut shutdown = SigSet::empty();
        for sig in SHUTDOWN_SIGNALS {
            shutdown.add(sig);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&shutdown), Some(&mut previous))
            .map_err(|e| WarpError::Spawn(format!("blocking shutdown signals failed: {e}")))?;

        let forked = workers.fork_children(count, &previous, &body);

        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
            warn!(error = %e, "Failed to restore the signal mask");
        }

        if let Err(e) = forked {
            workers.kill();
            // Already failing; reap only to avoid zombies
            let _ = workers.reap();
            return Err(e);
        }

        info!(children = workers.children.len(), "Worker processes launched");
        Ok(workers)
    }

    fn fork_children<F>(&mut self, count: NonZeroUsize, mask: &SigSet, body: &F) -> WarpResult<()>
    where
        F: Fn(usize) -> i32,
    {
        for index in 1..count.get() {
            // SAFETY: the child only runs `body` and then `_exit`s; it never
            // returns into code that assumes other threads survived the fork.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    debug!(index, pid = child.as_raw(), "Worker forked");
                    self.children.push(child);
                }
                Ok(ForkResult::Child) => child_main(index, self.launcher, mask, body),
                Err(e) => {
                    error!(index, error = %e, "fork failed");
                    return Err(WarpError::Spawn(format!("fork of worker {index} failed: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Pid of the launching process.
    #[must_use]
    pub fn launcher(&self) -> Pid {
        self.launcher
    }

    /// Pids of the children not collected yet.
    #[must_use]
    pub fn pids(&self) -> &[Pid] {
        &self.children
    }

    /// Send `SIGKILL` to every child.
    pub fn kill(&self) {
        for &pid in &self.children {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                warn!(pid = pid.as_raw(), error = %e, "Failed to kill worker");
            }
        }
    }

    /// Collect every child that has already exited, without blocking.
    ///
    /// Collected children are forgotten; [`reap`](Self::reap) only waits
    /// for the rest.
    pub fn try_reap(&mut self) -> Vec<WorkerExit> {
        let mut exited = Vec::new();
        self.children.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::EINTR) => true,
            status => {
                let failure = exit_failure(pid, status);
                exited.push(WorkerExit { pid, failure });
                false
            }
        });
        exited
    }

    /// Wait for every child to exit.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::Worker`] for the first child that exited with a
    /// non-zero status or was killed by a signal. All children are reaped
    /// regardless.
    pub fn reap(self) -> WarpResult<()> {
        let mut first_failure = None;

        for pid in self.children {
            if let Some(reason) = exit_failure(pid, wait_retrying(pid)) {
                first_failure.get_or_insert(WarpError::Worker {
                    worker: i64::from(pid.as_raw()),
                    reason,
                });
            }
        }

        first_failure.map_or(Ok(()), Err)
    }
}

/// Why a child ended badly, if it did. A signal always counts as failure.
fn exit_failure(pid: Pid, status: nix::Result<WaitStatus>) -> Option<String> {
    let failure = match status {
        Ok(WaitStatus::Exited(_, 0)) => {
            debug!(pid = pid.as_raw(), "Worker exited");
            return None;
        }
        Ok(WaitStatus::Exited(_, code)) => format!("exit status {code}"),
        Ok(WaitStatus::Signaled(_, signal, _)) => format!("killed by {signal}"),
        Ok(other) => format!("unexpected wait status {other:?}"),
        Err(e) => format!("waitpid failed: {e}"),
    };
    warn!(pid = pid.as_raw(), reason = %failure, "Worker terminated abnormally");
    Some(failure)
}

fn wait_retrying(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Entry point of a forked child. Never returns.
///
/// `mask` is the launcher's signal mask from before the fork.
fn child_main<F>(index: usize, launcher: Pid, mask: &SigSet, body: &F) -> !
where
    F: Fn(usize) -> i32,
{
    #[cfg(target_os = "linux")]
    die_with_parent(launcher);
    ignore_shutdown_signals();
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None) {
        warn!(error = %e, "Failed to restore the signal mask");
    }

    let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(index)))
        .unwrap_or(101);

    // SAFETY: _exit skips atexit handlers and stdio buffers inherited from
    // the launcher, which must only be flushed once.
    unsafe { libc::_exit(code) }
}

/// Replace the launcher's shutdown handlers with SIG_IGN. Pending instances
/// are discarded.
fn ignore_shutdown_signals() {
    for sig in SHUTDOWN_SIGNALS {
        // SAFETY: installing SIG_IGN runs no user code.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!(signal = %sig, error = %e, "Failed to ignore shutdown signal");
        }
    }
}

/// Ask the kernel to kill this child when the launcher dies.
///
/// Strictly the signal fires when the thread that forked exits, so the
/// launcher keeps that thread alive until every child is reaped.
#[cfg(target_os = "linux")]
fn die_with_parent(launcher: Pid) {
    // SAFETY: PR_SET_PDEATHSIG takes a signal number and has no other effect.
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if ret != 0 {
        warn!("PR_SET_PDEATHSIG failed; worker may outlive the launcher");
    }

    // The launcher may have died before prctl took effect
    if nix::unistd::getppid() != launcher {
        // SAFETY: see child_main
        unsafe { libc::_exit(1) }
    }
}
