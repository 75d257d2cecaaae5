//! Spin-lock usable across forked processes.
//!
//! The lock word lives next to the data it protects, so when the whole lock
//! is placed in a [`SharedRegion`](crate::shared::SharedRegion) every process
//! mapping that region contends on the same atomic. Critical sections here
//! are a handful of loads and stores, so waiters busy-wait with pause hints
//! instead of blocking in the kernel.
//!
//! # Cross-process invariants
//!
//! - The lock word holds the [`LockOwner`] tag of the holder and is 0 when
//!   free. All-zero memory is an unlocked lock, which is exactly what a fresh
//!   anonymous mapping contains.
//! - `SpinLock<T>` stores no pointers, so it is valid at whatever address
//!   each process maps it, provided `T` stores none either.
//! - A process that dies inside its critical section leaves its tag behind.
//!   Waiters check every so often whether the tagged process still runs, and
//!   take the lock over from one that is gone or only a zombie.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::cell::UnsafeCell;
use std::num::NonZeroU32;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// Upper bound on pause hints issued between two reads of the lock word.
const MAX_BACKOFF: u32 = 64;

/// Failed reads between two checks that the holder is still alive.
const SPINS_PER_LIVENESS_CHECK: u32 = 1 << 14;

/// Tag a holder writes into the lock word.
///
/// Tags are process ids. Threads of one process share a tag, so a holder
/// thread is never mistaken for a dead one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(NonZeroU32);

impl LockOwner {
    /// Tag of the calling process.
    #[must_use]
    pub fn current_process() -> Self {
        Self::process(Pid::this())
    }

    /// Tag of process `pid`.
    #[must_use]
    pub fn process(pid: Pid) -> Self {
        Self(NonZeroU32::new(pid.as_raw().unsigned_abs()).unwrap_or(NonZeroU32::MIN))
    }

    /// Process the tag names.
    #[must_use]
    pub fn pid(self) -> Pid {
        Pid::from_raw(i32::try_from(self.0.get()).unwrap_or(i32::MAX))
    }

    fn word(self) -> u32 {
        self.0.get()
    }
}

/// A test-and-test-and-set spin-lock with bounded exponential backoff that
/// remembers who holds it.
///
/// There is no fairness and no timeout. A waiter only gives up on a holder
/// whose process has exited.
#[repr(C)]
pub struct SpinLock<T> {
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spin-lock around `value`.
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock as `owner`, spinning until it is free or its
    /// holder has died.
    #[inline]
    pub fn lock(&self, owner: LockOwner) -> SpinLockGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock(owner) {
                return guard;
            }

            // Wait on a plain load so the cache line stays shared while held
            let mut backoff = 1u32;
            loop {
                let holder = self.owner.load(Ordering::Relaxed);
                if holder == 0 {
                    break;
                }

                spins = spins.wrapping_add(1);
                if spins % SPINS_PER_LIVENESS_CHECK == 0 && self.take_over(holder, owner) {
                    return SpinLockGuard { lock: self };
                }

                for _ in 0..backoff {
                    std::hint::spin_loop();
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    /// Try to acquire the lock as `owner` without spinning.
    #[inline]
    pub fn try_lock(&self, owner: LockOwner) -> Option<SpinLockGuard<'_, T>> {
        self.owner
            .compare_exchange_weak(0, owner.word(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Current holder, if any.
    #[inline]
    pub fn holder(&self) -> Option<LockOwner> {
        NonZeroU32::new(self.owner.load(Ordering::Relaxed)).map(LockOwner)
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Free the lock if `dead` still holds it.
    ///
    /// Only call this once `dead` is known to have exited, e.g. after it was
    /// reaped. Returns whether the lock was released.
    pub fn release_abandoned(&self, dead: LockOwner) -> bool {
        self.owner
            .compare_exchange(dead.word(), 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Swap the tag of a dead `holder` for `owner`.
    #[cold]
    fn take_over(&self, holder: u32, owner: LockOwner) -> bool {
        let Some(holder) = NonZeroU32::new(holder).map(LockOwner) else {
            return false;
        };
        if holder == owner || process_alive(holder.pid()) {
            return false;
        }
        self.owner
            .compare_exchange(holder.word(), owner.word(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Whether `pid` can still run. Zombies cannot.
fn process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Err(Errno::ESRCH) => false,
        _ => !is_zombie(pid),
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    // The state letter follows the parenthesized command name
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| matches!(state, 'Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

/// Guard that releases the spin-lock when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedRegion;

    /// Above the kernel's pid_max ceiling, so never a live process.
    fn nonexistent() -> LockOwner {
        LockOwner::process(Pid::from_raw(0x3FFF_FFFF))
    }

    #[test]
    fn test_spinlock_basic() {
        let me = LockOwner::current_process();
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock(me);
            *guard = 42;
            assert_eq!(lock.holder(), Some(me));
        }
        assert_eq!(*lock.lock(me), 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_zeroed_lock_is_unlocked() {
        let lock: SpinLock<u64> = SpinLock::default();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_spinlock_try_lock() {
        let me = LockOwner::current_process();
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock(me);
        assert!(guard.is_some());
        assert!(lock.is_locked());

        // While held, try_lock should fail
        assert!(lock.try_lock(me).is_none());

        drop(guard);
        assert!(lock.try_lock(me).is_some());
    }

    #[test]
    fn test_guard_released_on_early_return() {
        fn bump(lock: &SpinLock<u32>, fail: bool) -> Result<(), ()> {
            let mut guard = lock.lock(LockOwner::current_process());
            *guard += 1;
            if fail {
                return Err(());
            }
            *guard += 1;
            Ok(())
        }

        let lock = SpinLock::new(0u32);
        assert!(bump(&lock, true).is_err());
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(LockOwner::current_process()), 1);
    }

    #[test]
    fn test_owner_tag_roundtrips_pid() {
        let pid = Pid::from_raw(4242);
        assert_eq!(LockOwner::process(pid).pid(), pid);
        assert_eq!(LockOwner::current_process().pid(), Pid::this());
    }

    #[test]
    fn test_lock_taken_over_from_dead_holder() {
        let lock = SpinLock::new(7u32);
        std::mem::forget(lock.try_lock(nonexistent()).unwrap());
        assert_eq!(lock.holder(), Some(nonexistent()));

        let me = LockOwner::current_process();
        let guard = lock.lock(me);
        assert_eq!(*guard, 7);
        assert_eq!(lock.holder(), Some(me));
    }

    #[test]
    fn test_live_holder_never_taken_over() {
        let me = LockOwner::current_process();
        let lock = SpinLock::new(0u32);
        let guard = lock.lock(me);

        assert!(!lock.take_over(me.word(), me));
        assert!(!lock.release_abandoned(nonexistent()));
        assert_eq!(lock.holder(), Some(me));
        drop(guard);
    }

    #[test]
    fn test_release_abandoned() {
        let lock = SpinLock::new(0u32);
        std::mem::forget(lock.try_lock(nonexistent()).unwrap());

        assert!(lock.release_abandoned(nonexistent()));
        assert!(!lock.is_locked());
        assert!(!lock.release_abandoned(nonexistent()));
    }

    #[test]
    fn test_spinlock_concurrent_in_shared_region() {
        let lock = SharedRegion::new(SpinLock::new(0u64)).unwrap();
        let me = LockOwner::current_process();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *lock.lock(me) += 1;
                    }
                });
            }
        });

        assert_eq!(*lock.lock(me), 40_000);
    }
}
