//! Signal handling for a clean stop.
//!
//! SIGINT and SIGTERM raise a process-wide flag that the reporting loop
//! polls. A second signal while the first is still being handled exits
//! immediately.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_shutdown_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::Relaxed);
    if SHUTDOWN.swap(true, Ordering::Relaxed) {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(128 + signum) }
    }
}

/// Handle to the installed shutdown handlers.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSignal {
    _installed: (),
}

impl ShutdownSignal {
    /// Install handlers for SIGINT and SIGTERM.
    ///
    /// `SA_RESTART` is left off so a blocked `waitpid` wakes up.
    ///
    /// # Errors
    ///
    /// Returns the errno of the first failed `sigaction`.
    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_shutdown_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only touches atomics and calls _exit.
            unsafe { sigaction(sig, &action) }?;
        }
        debug!("Shutdown signal handlers installed");
        Ok(Self { _installed: () })
    }

    /// Flag raised by the handlers.
    #[must_use]
    pub fn flag(&self) -> &'static AtomicBool {
        &SHUTDOWN
    }

    /// Check whether a shutdown signal arrived.
    #[must_use]
    pub fn requested(&self) -> bool {
        SHUTDOWN.load(Ordering::Relaxed)
    }

    /// The most recent signal received.
    #[must_use]
    pub fn last_signal(&self) -> Option<Signal> {
        match LAST_SIGNAL.load(Ordering::Relaxed) {
            0 => None,
            n => Signal::try_from(n).ok(),
        }
    }
}
