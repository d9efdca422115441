//! A fair, ticket-ordered mutual-exclusion gate with keyed wait channels.
//!
//! See the [`Gate`] type's documentation for details.

use crate::{
    blocking::{Mutex, MutexGuard},
    loom::{
        cell::{MutPtr, UnsafeCell},
        sync::{
            atomic::{AtomicBool, Ordering::*},
            Arc,
        },
        thread::{self, Thread},
    },
    util::fmt,
    OutOfMemory, WaitOutcome, WaitResult,
};
use std::collections::VecDeque;

use self::registry::{ChannelWaiter, EventRegistry};

mod registry;

pub use self::registry::EventKey;

/// A fair mutual-exclusion gate protecting `T`, with keyed broadcast wait
/// channels and release-time deferred dispatch.
///
/// A `Gate` is the main lock of a driver-style subsystem. It differs from an
/// ordinary mutex in three ways:
///
/// - **Ticketed hand-off**: when the gate is released with blocked waiters,
///   ownership passes to the *oldest* waiter specifically, which claims it by
///   matching the gate's hand-off ticket. Admission is strict FIFO by arrival
///   order at the slow path; there is no re-race on release.
/// - **Interrupt-safe acquire**: [`try_lock`](Self::try_lock) never parks and
///   never allocates, so it may be called from contexts that must not block.
///   When it fails, it flags one-shot deferred work to be run by the next
///   release, outside every lock (see [`DeferredHook`]).
/// - **Keyed wait channels**: a holder can atomically release the gate and
///   sleep until a key is signalled ([`GateGuard::wait`]), and any context
///   can broadcast-wake all sleepers on a key ([`wake_all`](Self::wake_all)).
///   A signal delivered between the release and the sleep is never lost.
///
/// The protected data is reached through the RAII [`GateGuard`] returned by
/// [`lock`](Self::lock)/[`try_lock`](Self::try_lock). Gates that only need
/// the synchronization contract can use the default `T = ()`.
///
/// # Lock ordering
///
/// Internally the gate uses one spinlock for its core state and one per event
/// channel, all held only for short, non-blocking critical sections. The
/// ordering rule is global: the core lock may be held while taking a channel
/// lock, never the reverse. Blocking happens only at the explicit parking
/// points in the acquire slow path and the wait loop.
pub struct Gate<T = ()> {
    core: Mutex<Core>,
    data: UnsafeCell<T>,
}

/// Everything guarded by the gate's internal spinlock.
struct Core {
    /// 1 when the gate is free, 0 when held. Contention is tracked by the
    /// queue, not by negative counts.
    count: usize,
    /// Blocked callers, oldest first.
    wait_queue: VecDeque<Arc<WaitSlot>>,
    /// The waiter designated to receive the gate next, if any.
    ///
    /// Either the gate is free (`count == 1`, empty queue), held with no
    /// successor, or held with exactly this successor.
    handoff: Option<Arc<WaitSlot>>,
    /// Set by a failed `try_lock`; consumed by the next release.
    deferred_pending: bool,
    hook: Option<Arc<dyn DeferredHook>>,
    events: EventRegistry,
}

/// One pending acquisition attempt. Identity is the `Arc` pointer; the slot
/// is resumed by unparking its captured thread handle.
struct WaitSlot {
    thread: Thread,
}

/// An RAII guard proving the current thread holds a [`Gate`].
///
/// The protected data is accessed through this guard's [`Deref`] and
/// [`DerefMut`] implementations. Dropping the guard releases the gate,
/// running any pending deferred dispatch and handing the gate to the oldest
/// blocked waiter.
///
/// [`Deref`]: core::ops::Deref
/// [`DerefMut`]: core::ops::DerefMut
#[must_use = "if unused, the `Gate` will immediately unlock"]
pub struct GateGuard<'a, T = ()> {
    gate: &'a Gate<T>,
    ptr: MutPtr<T>,
}

/// A device bottom-half callback, run by gate release when a failed
/// [`Gate::try_lock`] flagged deferred work.
///
/// [`dispatch`](Self::dispatch) always runs outside the gate's internal
/// locks, exactly once per release that observed the flag. It must not
/// re-enter the releasing gate's release path (dropping another guard of the
/// same gate from inside the hook is undefined); waking channels or trying
/// the lock again is fine.
pub trait DeferredHook: Send + Sync {
    /// Runs the bottom-half processing this hook was bound for.
    fn dispatch(&self) -> DeferredStatus;

    /// Fire-and-forget submission of follow-on work to a separate execution
    /// context, invoked once when [`dispatch`](Self::dispatch) returns
    /// [`DeferredStatus::QueueWork`]. The gate has no further involvement
    /// after this call.
    fn queue_work(&self) {}
}

/// What a [`DeferredHook::dispatch`] call wants done next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeferredStatus {
    /// Bottom-half processing is complete.
    Idle,
    /// Schedule follow-on work via [`DeferredHook::queue_work`].
    QueueWork,
}

/// A cancellation token for [`GateGuard::wait_interruptible`].
///
/// Raising the token is the userland analog of delivering a signal to the
/// waiting thread: the waiter observes it at its next recheck, unregisters
/// from its channel, reacquires the gate, and reports
/// [`WaitOutcome::Interrupted`].
///
/// A token serves one waiter at a time; it can be [`reset`](Self::reset) and
/// reused once that wait has returned.
pub struct Interrupt {
    raised: AtomicBool,
    waiter: Mutex<Option<Thread>>,
}

// === impl Gate ===

impl<T> Gate<T> {
    loom_const_fn! {
        /// Returns a new `Gate` protecting the provided `data`, unlocked and
        /// with an effectively unbounded event table.
        #[must_use]
        pub fn new(data: T) -> Self {
            Self::with_event_capacity(data, usize::MAX)
        }
    }

    loom_const_fn! {
        /// Returns a new `Gate` whose event table holds at most `capacity`
        /// concurrent channels.
        ///
        /// Waiting on a key when the table is full and no channel for that
        /// key exists yet fails with [`OutOfMemory`].
        #[must_use]
        pub fn with_event_capacity(data: T, capacity: usize) -> Self {
            Self {
                core: Mutex::new(Core {
                    count: 1,
                    wait_queue: VecDeque::new(),
                    handoff: None,
                    deferred_pending: false,
                    hook: None,
                    events: EventRegistry::new(capacity),
                }),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Binds the bottom-half callback run by release when a failed
    /// [`try_lock`](Self::try_lock) flagged deferred work.
    ///
    /// Rebinding replaces the previous hook; a release that observes the
    /// deferred flag while no hook is bound just clears the flag.
    pub fn bind_deferred_hook<H: DeferredHook + 'static>(&self, hook: H) {
        self.core.lock().hook = Some(Arc::new(hook));
    }

    /// Acquires the gate, parking the calling thread until it is granted.
    ///
    /// If the gate is contended, the caller joins a FIFO queue and is granted
    /// the gate by a ticketed hand-off when its turn comes; callers that
    /// queued earlier are always admitted first.
    pub fn lock(&self) -> GateGuard<'_, T> {
        let core = self.core.lock();
        let core = self.lock_gated(core);
        drop(core);
        self.guard()
    }

    /// Attempts to acquire the gate without ever parking.
    ///
    /// This is the acquire path for restricted contexts (interrupt handlers
    /// and the like): it takes only the gate's internal spinlock and never
    /// suspends or allocates. If the gate is free, it is taken. If a hand-off
    /// to a queued waiter is pending, the hand-off is stolen and the
    /// displaced waiter keeps its place at the head of the queue, to be
    /// granted the gate on a later release. Otherwise the acquire fails and
    /// the gate's one-shot deferred flag is set, so that the next release
    /// runs the bound [`DeferredHook`] on this caller's behalf.
    pub fn try_lock(&self) -> Option<GateGuard<'_, T>> {
        let mut core = self.core.lock();
        let acquired = if core.count > 0 {
            core.count -= 1;
            true
        } else if let Some(displaced) = core.handoff.take() {
            trace!(slot = ?fmt::ptr(Arc::as_ptr(&displaced)), "gate: stole pending hand-off");
            // The designated successor finds no ticket when it resumes and
            // simply parks again; front placement keeps its admission order.
            core.wait_queue.push_front(displaced);
            true
        } else {
            core.deferred_pending = true;
            false
        };
        drop(core);
        acquired.then(|| self.guard())
    }

    /// Marks every waiter currently parked on `key`'s channel as triggered
    /// and wakes them all.
    ///
    /// Broadcast is unordered: woken waiters independently re-race for the
    /// gate through its FIFO queue. If nobody has a channel open for `key`,
    /// this is a no-op with no side effects and no allocation. Callable from
    /// any context; never parks.
    pub fn wake_all(&self, key: EventKey) {
        let channel = self.core.lock().events.lookup(key);
        let Some(channel) = channel else {
            test_trace!(key, "gate: wake_all on idle key");
            return;
        };

        channel.broadcast();

        self.core.lock().events.release(&channel);
    }

    /// Consumes this `Gate`, returning the guarded data.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Gate` mutably, no locking needs to take
    /// place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: the mutable borrow statically guarantees no guards
            // exist.
            self.data.with_mut(|data| &mut *data)
        }
    }

    fn guard(&self) -> GateGuard<'_, T> {
        GateGuard {
            gate: self,
            ptr: self.data.get_mut(),
        }
    }

    /// Acquire while already holding the core lock. Returns with the core
    /// lock held and the gate owned by the calling thread.
    fn lock_gated<'a>(&'a self, mut core: MutexGuard<'a, Core>) -> MutexGuard<'a, Core> {
        if core.count > 0 {
            core.count -= 1;
            return core;
        }

        let slot = Arc::new(WaitSlot {
            thread: thread::current(),
        });
        trace!(slot = ?fmt::ptr(Arc::as_ptr(&slot)), "gate: queued");
        core.wait_queue.push_back(slot.clone());

        loop {
            drop(core);
            thread::park();
            core = self.core.lock();
            // Resumed: the gate is ours only if the hand-off ticket names
            // this slot. Anything else is a spurious wake.
            if core
                .handoff
                .as_ref()
                .is_some_and(|next| Arc::ptr_eq(next, &slot))
            {
                core.handoff = None;
                trace!(slot = ?fmt::ptr(Arc::as_ptr(&slot)), "gate: claimed hand-off");
                return core;
            }
        }
    }

    /// Release while already holding the core lock. Returns with the core
    /// lock held; the gate itself has been handed off or freed.
    ///
    /// If deferred work is pending, the core lock is dropped around the hook
    /// invocation: the hook may take locks of its own and must never run
    /// under ours.
    fn unlock_gated<'a>(&'a self, mut core: MutexGuard<'a, Core>) -> MutexGuard<'a, Core> {
        debug_assert_eq!(core.count, 0, "released a gate that was not held");
        debug_assert!(
            core.handoff.is_none(),
            "released a gate with a hand-off already pending"
        );

        if core.deferred_pending {
            core.deferred_pending = false;
            let hook = core.hook.clone();
            drop(core);
            if let Some(hook) = hook {
                test_trace!("gate: deferred dispatch");
                if hook.dispatch() == DeferredStatus::QueueWork {
                    hook.queue_work();
                }
            }
            core = self.core.lock();
        }

        if let Some(next) = core.wait_queue.pop_front() {
            trace!(slot = ?fmt::ptr(Arc::as_ptr(&next)), "gate: handing off");
            next.thread.unpark();
            core.handoff = Some(next);
        } else {
            core.count += 1;
        }
        core
    }

    fn unlock(&self) {
        let core = self.core.lock();
        let core = self.unlock_gated(core);
        drop(core);
    }

    /// The combined release-and-sleep protocol. Entered holding the gate;
    /// returns holding the gate, whatever happened in between.
    fn wait_inner(&self, key: EventKey, interrupt: Option<&Interrupt>) -> WaitResult {
        let mut core = self.core.lock();

        // Take a reference on the channel before letting go of anything. If
        // the table is full the gate is simply never released: the caller
        // still holds it when it sees the error.
        let Some(channel) = core.events.get_or_create(key) else {
            return Err(OutOfMemory::new());
        };

        // Release the gate. Other callers may take it as soon as the core
        // lock drops below.
        core = self.unlock_gated(core);

        let waiter = Arc::new(ChannelWaiter::new(thread::current()));
        if let Some(interrupt) = interrupt {
            interrupt.register();
        }

        let mut outcome = WaitOutcome::Awakened;
        {
            // Register on the channel while the core lock is still held
            // (core-then-channel ordering). A wake racing with this wait
            // cannot run its lookup until the core lock drops, and by then
            // the waiter is registered: nothing can slip between the release
            // and the sleep.
            let mut waiters = channel.waiters.lock();
            waiters.push(waiter.clone());
            drop(core);

            loop {
                if waiter.is_triggered() {
                    break;
                }
                if interrupt.is_some_and(|i| i.is_raised()) {
                    outcome = WaitOutcome::Interrupted;
                    break;
                }
                drop(waiters);
                thread::park();
                waiters = channel.waiters.lock();
            }

            waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
        }

        if let Some(interrupt) = interrupt {
            interrupt.deregister();
        }

        trace!(key, ?outcome, "gate: wait ended, reacquiring");

        // Drop this operation's channel reference, then rejoin the gate's
        // normal FIFO admission.
        let mut core = self.core.lock();
        core.events.release(&channel);
        let core = self.lock_gated(core);
        drop(core);

        Ok(outcome)
    }

    #[cfg(test)]
    fn queued_waiters(&self) -> usize {
        self.core.lock().wait_queue.len()
    }

    #[cfg(test)]
    fn live_channels(&self) -> usize {
        self.core.lock().events.len()
    }

    #[cfg(test)]
    fn channel_waiters(&self, key: EventKey) -> usize {
        let channel = self.core.lock().events.lookup(key);
        let Some(channel) = channel else { return 0 };
        let count = channel.waiter_count();
        self.core.lock().events.release(&channel);
        count
    }
}

impl<T: Default> Default for Gate<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("core", &fmt::opt(&self.core.try_lock()).or_else("<locked>"))
            .finish()
    }
}

unsafe impl<T: Send> Send for Gate<T> {}
unsafe impl<T: Send> Sync for Gate<T> {}

// === impl Core ===

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("count", &self.count)
            .field("queued", &self.wait_queue.len())
            .field("handoff", &self.handoff.is_some())
            .field("deferred_pending", &self.deferred_pending)
            .field("hook", &self.hook.is_some())
            .field("events", &self.events)
            .finish()
    }
}

// === impl GateGuard ===

impl<'a, T> GateGuard<'a, T> {
    /// Atomically releases the gate and parks until `key` is signalled by
    /// [`Gate::wake_all`], then reacquires the gate.
    ///
    /// If a wake on `key` races with the release, the wait still observes it
    /// and returns without parking. Whatever the outcome, the caller holds
    /// the gate again when this returns — including on
    /// [`Err(OutOfMemory)`](OutOfMemory), where the gate was never released.
    ///
    /// The guard cannot be used to reach the protected data while the wait is
    /// in progress; by the time this method returns, the gate is held again
    /// and the guard is as valid as it was on entry.
    pub fn wait(&mut self, key: EventKey) -> WaitResult {
        self.gate.wait_inner(key, None)
    }

    /// Like [`wait`](Self::wait), but the wait can be cancelled by raising
    /// `interrupt`.
    ///
    /// Cancellation is observed at the wait loop's recheck point; a cancelled
    /// waiter unregisters from its channel exactly like a woken one, then
    /// reacquires the gate and returns [`Ok(WaitOutcome::Interrupted)`].
    /// A wake that arrives before the cancellation is observed wins.
    ///
    /// [`Ok(WaitOutcome::Interrupted)`]: WaitOutcome::Interrupted
    pub fn wait_interruptible(&mut self, key: EventKey, interrupt: &Interrupt) -> WaitResult {
        self.gate.wait_inner(key, Some(interrupt))
    }
}

impl<'a, T> core::ops::Deref for GateGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: this thread holds the gate, so it is okay to
            // dereference the mut pointer.
            &*self.ptr.deref()
        }
    }
}

impl<'a, T> core::ops::DerefMut for GateGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: this thread holds the gate, so it is okay to
            // dereference the mut pointer.
            self.ptr.deref()
        }
    }
}

impl<'a, T> Drop for GateGuard<'a, T> {
    fn drop(&mut self) {
        self.gate.unlock()
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for GateGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        core::ops::Deref::deref(self).fmt(f)
    }
}

unsafe impl<T: Send> Send for GateGuard<'_, T> {}
unsafe impl<T: Send + Sync> Sync for GateGuard<'_, T> {}

// === impl Interrupt ===

impl Interrupt {
    loom_const_fn! {
        /// Returns a new, unraised `Interrupt`.
        #[must_use]
        pub fn new() -> Self {
            Self {
                raised: AtomicBool::new(false),
                waiter: Mutex::new(None),
            }
        }
    }

    /// Raises the interrupt, waking the registered waiter (if any) so it can
    /// observe the cancellation.
    ///
    /// Raising an interrupt nobody is waiting on is not an error; the flag
    /// stays set and the next [`wait_interruptible`] using this token returns
    /// [`WaitOutcome::Interrupted`] immediately.
    ///
    /// [`wait_interruptible`]: GateGuard::wait_interruptible
    pub fn raise(&self) {
        self.raised.store(true, Release);
        if let Some(thread) = &*self.waiter.lock() {
            thread.unpark();
        }
    }

    /// Returns `true` if the interrupt has been raised and not yet reset.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Acquire)
    }

    /// Clears the raised flag, rearming the token for another wait.
    pub fn reset(&self) {
        self.raised.store(false, Release);
    }

    fn register(&self) {
        *self.waiter.lock() = Some(thread::current());
    }

    fn deregister(&self) {
        *self.waiter.lock() = None;
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("raised", &self.is_raised())
            .finish()
    }
}
