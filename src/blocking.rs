//! A blocking data mutex built on the [`spin::Spinlock`](crate::spin::Spinlock).
//!
//! This is the lock the gate uses for all of its short internal critical
//! sections: the gate's core state, each event channel's waiter list, and the
//! [`Interrupt`](crate::Interrupt) token's registration slot. It is *not* the
//! gate itself — callers never hold one of these across a suspension point.
//!
//! When `cfg(loom)` is enabled, this mutex is replaced by a thin wrapper
//! around [`loom::sync::Mutex`], because loom's model checker does not play
//! nicely with real spinlocks.

#[cfg(not(loom))]
pub use self::real::{Mutex, MutexGuard};

#[cfg(loom)]
pub use self::mocked::{Mutex, MutexGuard};

#[cfg(not(loom))]
mod real {
    use crate::{
        loom::cell::{MutPtr, UnsafeCell},
        spin::Spinlock,
        util::fmt,
    };
    use core::ops::{Deref, DerefMut};

    /// A blocking mutual exclusion lock for protecting shared data.
    ///
    /// The data can only be accessed through the RAII guard returned from
    /// [`lock`] and [`try_lock`], which guarantees that the data is only ever
    /// accessed while the mutex is locked.
    ///
    /// This is *not* a fair mutex; fairness is the job of the
    /// [`Gate`](crate::Gate) built on top of it, which holds this lock only
    /// for short, non-blocking critical sections.
    ///
    /// [`lock`]: Mutex::lock
    /// [`try_lock`]: Mutex::try_lock
    pub struct Mutex<T> {
        lock: Spinlock,
        data: UnsafeCell<T>,
    }

    /// An RAII guard for a [`Mutex`]. The lock is released when the guard is
    /// dropped.
    #[must_use = "if unused, the `Mutex` will immediately unlock"]
    pub struct MutexGuard<'a, T> {
        ptr: MutPtr<T>,
        lock: &'a Spinlock,
    }

    // === impl Mutex ===

    impl<T> Mutex<T> {
        loom_const_fn! {
            /// Returns a new `Mutex` protecting the provided `data`, in an
            /// unlocked state.
            #[must_use]
            pub fn new(data: T) -> Self {
                Self {
                    lock: Spinlock::new(),
                    data: UnsafeCell::new(data),
                }
            }
        }

        fn guard(&self) -> MutexGuard<'_, T> {
            MutexGuard {
                ptr: self.data.get_mut(),
                lock: &self.lock,
            }
        }

        /// Acquires the mutex, spinning until it is locked.
        #[cfg_attr(test, track_caller)]
        pub fn lock(&self) -> MutexGuard<'_, T> {
            self.lock.lock();
            self.guard()
        }

        /// Attempts to acquire the mutex without spinning.
        ///
        /// Returns [`None`] if the mutex is currently locked.
        #[must_use]
        #[cfg_attr(test, track_caller)]
        pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
            if self.lock.try_lock() {
                Some(self.guard())
            } else {
                None
            }
        }

        /// Consumes this `Mutex`, returning the guarded data.
        #[inline]
        #[must_use]
        pub fn into_inner(self) -> T {
            self.data.into_inner()
        }

        /// Returns a mutable reference to the underlying data.
        ///
        /// Since this call borrows the `Mutex` mutably, no actual locking
        /// needs to take place.
        pub fn get_mut(&mut self) -> &mut T {
            unsafe {
                // Safety: the mutable borrow statically guarantees no guards
                // exist.
                self.data.with_mut(|data| &mut *data)
            }
        }
    }

    impl<T: Default> Default for Mutex<T> {
        fn default() -> Self {
            Self::new(Default::default())
        }
    }

    impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Mutex")
                .field("data", &fmt::opt(&self.try_lock()).or_else("<locked>"))
                .field("lock", &self.lock)
                .finish()
        }
    }

    unsafe impl<T: Send> Send for Mutex<T> {}
    unsafe impl<T: Send> Sync for Mutex<T> {}

    // === impl MutexGuard ===

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;
        #[inline]
        fn deref(&self) -> &Self::Target {
            unsafe {
                // Safety: we are holding the lock, so it is okay to
                // dereference the mut pointer.
                &*self.ptr.deref()
            }
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        #[inline]
        fn deref_mut(&mut self) -> &mut Self::Target {
            unsafe {
                // Safety: we are holding the lock, so it is okay to
                // dereference the mut pointer.
                self.ptr.deref()
            }
        }
    }

    impl<T> Drop for MutexGuard<'_, T> {
        #[inline]
        #[cfg_attr(test, track_caller)]
        fn drop(&mut self) {
            unsafe { self.lock.unlock() }
        }
    }

    impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.deref().fmt(f)
        }
    }

    unsafe impl<T: Send> Send for MutexGuard<'_, T> {}
    unsafe impl<T: Send + Sync> Sync for MutexGuard<'_, T> {}
}

#[cfg(loom)]
mod mocked {
    use core::fmt;
    use core::ops::{Deref, DerefMut};

    /// Mock version of the spinlock mutex, using `loom::sync::Mutex`. The
    /// loom mutex supports poisoning, which the real one does not; poisoning
    /// is treated as unreachable.
    pub struct Mutex<T>(loom::sync::Mutex<T>);

    /// An RAII guard for a [`Mutex`].
    #[must_use = "if unused, the `Mutex` will immediately unlock"]
    pub struct MutexGuard<'a, T>(loom::sync::MutexGuard<'a, T>);

    impl<T> Mutex<T> {
        #[track_caller]
        pub fn new(data: T) -> Self {
            Self(loom::sync::Mutex::new(data))
        }

        #[track_caller]
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(self.0.lock().expect("loom mutex will never poison"))
        }

        #[track_caller]
        pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
            self.0.try_lock().ok().map(MutexGuard)
        }

        pub fn into_inner(self) -> T {
            self.0.into_inner().expect("loom mutex will never poison")
        }

        pub fn get_mut(&mut self) -> &mut T {
            self.0.get_mut().expect("loom mutex will never poison")
        }
    }

    impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;
        #[inline]
        fn deref(&self) -> &Self::Target {
            self.0.deref()
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        #[inline]
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.0.deref_mut()
        }
    }

    impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }
}
