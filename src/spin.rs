//! The raw spinlock guarding the gate's internal state.
//!
//! The gate and its event channels only ever hold their internal locks for
//! short, non-blocking critical sections, so those locks are implemented by
//! spinning rather than by suspending the caller. This keeps them usable from
//! restricted contexts that must never park (the same contexts that call
//! [`Gate::try_lock`](crate::Gate::try_lock) and
//! [`Gate::wake_all`](crate::Gate::wake_all)).
//!
//! The data-carrying wrapper around this lock lives in [`crate::blocking`];
//! the raw lock is exposed here for embedders who need a standalone spinlock
//! with the same backoff behavior.

use crate::{
    loom::sync::atomic::{AtomicBool, Ordering::*},
    util::Backoff,
};

/// A test-and-set spinlock with exponential backoff.
///
/// Spins with a [`Backoff`] while waiting for the lock to become available.
#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
}

// === impl Spinlock ===

impl Spinlock {
    loom_const_fn! {
        /// Returns a new `Spinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { locked: AtomicBool::new(false) }
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        let mut boff = Backoff::default();
        while test_dbg!(self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_err())
        {
            while test_dbg!(self.is_locked()) {
                boff.spin();
            }
        }
    }

    /// Attempts to acquire the lock without spinning. Returns `true` if the
    /// lock was acquired and `false` otherwise.
    #[cfg_attr(test, track_caller)]
    #[inline]
    pub fn try_lock(&self) -> bool {
        test_dbg!(self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok())
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// This may only be called when the lock is held in the current context,
    /// i.e. it must be paired with a successful [`lock`](Self::lock) or
    /// [`try_lock`](Self::try_lock).
    #[cfg_attr(test, track_caller)]
    #[inline]
    pub unsafe fn unlock(&self) {
        test_dbg!(self.locked.store(false, Release));
    }

    /// Returns `true` if the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}
