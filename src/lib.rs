#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub mod util;

pub mod blocking;
pub mod gate;
pub mod spin;

#[doc(inline)]
pub use self::gate::{
    DeferredHook, DeferredStatus, EventKey, Gate, GateGuard, Interrupt,
};

use core::fmt;

/// How a completed wait on a [`Gate`] event channel ended.
///
/// Returned by [`GateGuard::wait`] and [`GateGuard::wait_interruptible`]. In
/// both cases the caller holds the gate again by the time it sees this value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The wait was ended by a [`wake_all`](Gate::wake_all) on its key.
    Awakened,
    /// The wait was cancelled by [`Interrupt::raise`] before being woken.
    ///
    /// This is a normal cancellation outcome, not a fault: the waiter was
    /// removed from its channel and the gate was reacquired as usual. Callers
    /// should unwind whatever operation the wait was part of.
    Interrupted,
}

/// An error indicating that a new event channel could not be allocated.
///
/// Returned by [`GateGuard::wait`] and [`GateGuard::wait_interruptible`] when
/// the gate's event table is already at the capacity configured by
/// [`Gate::with_event_capacity`]. Channel creation happens under the gate's
/// internal spinlock and must not block, so it fails explicitly rather than
/// waiting for memory.
///
/// On this path the gate was never released; the caller still holds it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfMemory(());

/// The result of waiting on a [`Gate`] event channel.
pub type WaitResult = Result<WaitOutcome, OutOfMemory>;

impl OutOfMemory {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("event table is full")
    }
}

impl std::error::Error for OutOfMemory {}
