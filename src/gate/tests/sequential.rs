use super::*;
use crate::{DeferredHook, DeferredStatus, OutOfMemory};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

/// A hook that counts its invocations and returns a fixed status.
struct CountingHook {
    status: DeferredStatus,
    dispatched: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl DeferredHook for CountingHook {
    fn dispatch(&self) -> DeferredStatus {
        self.dispatched.fetch_add(1, SeqCst);
        self.status
    }

    fn queue_work(&self) {
        self.queued.fetch_add(1, SeqCst);
    }
}

fn counting_hook(status: DeferredStatus) -> (CountingHook, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let dispatched = Arc::new(AtomicUsize::new(0));
    let queued = Arc::new(AtomicUsize::new(0));
    let hook = CountingHook {
        status,
        dispatched: dispatched.clone(),
        queued: queued.clone(),
    };
    (hook, dispatched, queued)
}

#[test]
fn uncontended() {
    let _trace = test::trace_init();
    let gate = Gate::new(41);
    {
        let mut guard = gate.lock();
        *guard += 1;
    }
    assert_eq!(*gate.lock(), 42);
}

#[test]
fn try_lock_when_free() {
    let _trace = test::trace_init();
    let gate = Gate::new(());

    let a = gate.try_lock();
    assert!(a.is_some());

    // Additional try fails.
    assert!(gate.try_lock().is_none());

    // After dropping the guard, it succeeds again.
    drop(a);
    assert!(gate.try_lock().is_some());
}

#[test]
fn failed_try_lock_defers_dispatch() {
    let _trace = test::trace_init();
    let gate = Gate::new(());
    let (hook, dispatched, queued) = counting_hook(DeferredStatus::Idle);
    gate.bind_deferred_hook(hook);

    let held = gate.lock();
    assert!(gate.try_lock().is_none());
    assert_eq!(dispatched.load(SeqCst), 0, "hook must wait for the release");

    drop(held);
    assert_eq!(dispatched.load(SeqCst), 1);
    assert_eq!(queued.load(SeqCst), 0);

    // The flag is one-shot: an ordinary lock/unlock cycle must not re-run it.
    drop(gate.lock());
    assert_eq!(dispatched.load(SeqCst), 1);
}

#[test]
fn deferred_dispatch_queues_work() {
    let _trace = test::trace_init();
    let gate = Gate::new(());
    let (hook, dispatched, queued) = counting_hook(DeferredStatus::QueueWork);
    gate.bind_deferred_hook(hook);

    let held = gate.lock();
    assert!(gate.try_lock().is_none());
    drop(held);

    assert_eq!(dispatched.load(SeqCst), 1);
    assert_eq!(queued.load(SeqCst), 1);
}

#[test]
fn deferred_flag_without_hook() {
    let _trace = test::trace_init();
    let gate = Gate::new(());
    let held = gate.lock();
    assert!(gate.try_lock().is_none());
    // Release observes the flag with nothing bound; must just clear it.
    drop(held);
    assert!(gate.try_lock().is_some());
}

#[test]
fn wait_fails_when_event_table_full() {
    let _trace = test::trace_init();
    let gate = Gate::with_event_capacity((), 0);
    let mut guard = gate.lock();

    assert_eq!(guard.wait(1), Err(OutOfMemory::new()));

    // The gate was never released on that path: one drop must free it.
    drop(guard);
    assert!(gate.try_lock().is_some());
    assert_eq!(gate.live_channels(), 0);
}

#[test]
fn wait_interruptible_observes_pre_raised_interrupt() {
    let _trace = test::trace_init();
    let gate = Gate::new(());
    let interrupt = Interrupt::new();
    interrupt.raise();

    let mut guard = gate.lock();
    assert_eq!(
        guard.wait_interruptible(7, &interrupt),
        Ok(WaitOutcome::Interrupted)
    );

    // Returned holding the gate; the channel reference was dropped.
    assert_eq!(gate.live_channels(), 0);
    drop(guard);
    assert!(gate.try_lock().is_some());

    interrupt.reset();
    assert!(!interrupt.is_raised());
}

#[test]
fn wake_all_on_idle_key_is_a_no_op() {
    let _trace = test::trace_init();
    let gate = Gate::<()>::default();
    gate.wake_all(0xdead);
    assert_eq!(gate.live_channels(), 0);
}

#[test]
fn debug_impls() {
    let _trace = test::trace_init();
    let gate = Gate::new(1u8);
    assert!(format!("{gate:?}").contains("Gate"));

    let guard = gate.lock();
    // The core lock is free while the gate is held; Debug must not wedge.
    assert!(format!("{gate:?}").contains("count: 0"));
    assert_eq!(format!("{guard:?}"), "1");

    assert!(format!("{:?}", Interrupt::new()).contains("raised: false"));
}
