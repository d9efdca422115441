//! Multi-threaded tests using real OS threads and real parking. These are
//! about ordering and hand-off contracts; the loom models next door cover the
//! memory-ordering races exhaustively.

use super::*;
use crate::loom::thread;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

/// Polls `f` until it returns `true`, panicking if it takes implausibly long.
#[track_caller]
fn await_condition(what: &str, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for {what}"
        );
        thread::yield_now();
    }
}

#[test]
fn fifo_fairness() {
    let _trace = test::trace_init();
    const THREADS: usize = 5;

    let gate = Arc::new(Gate::new(Vec::new()));
    let held = gate.lock();

    // Admit the contenders one at a time, so their queue order is known.
    let mut joins = Vec::with_capacity(THREADS);
    for i in 0..THREADS {
        joins.push(thread::spawn({
            let gate = gate.clone();
            move || gate.lock().push(i)
        }));
        await_condition("contender to queue", || gate.queued_waiters() == i + 1);
    }

    drop(held);
    for join in joins {
        join.join().unwrap();
    }

    assert_eq!(&*gate.lock(), &[0, 1, 2, 3, 4]);
}

#[test]
fn wake_then_reacquire() {
    let _trace = test::trace_init();
    const KEY: EventKey = 0x10;

    let gate = Arc::new(Gate::new(()));
    let waiter = thread::spawn({
        let gate = gate.clone();
        move || {
            let mut guard = gate.lock();
            let outcome = guard.wait(KEY);
            drop(guard);
            outcome
        }
    });

    await_condition("waiter to register", || gate.channel_waiters(KEY) == 1);

    // The wait released the gate, so this thread can take it, and can signal
    // the key while still holding it. The woken waiter then has to queue
    // behind us for readmission.
    let held = gate.lock();
    gate.wake_all(KEY);
    drop(held);

    assert_eq!(waiter.join().unwrap(), Ok(WaitOutcome::Awakened));
    assert_eq!(gate.live_channels(), 0);
}

#[test]
fn broadcast_wakes_every_waiter() {
    let _trace = test::trace_init();
    const KEY: EventKey = 7;
    const WAITERS: usize = 3;

    let gate = Arc::new(Gate::new(()));
    let joins: Vec<_> = (0..WAITERS)
        .map(|_| {
            thread::spawn({
                let gate = gate.clone();
                move || {
                    let mut guard = gate.lock();
                    let outcome = guard.wait(KEY);
                    drop(guard);
                    outcome
                }
            })
        })
        .collect();

    await_condition("all waiters to register", || {
        gate.channel_waiters(KEY) == WAITERS
    });

    gate.wake_all(KEY);
    for join in joins {
        assert_eq!(join.join().unwrap(), Ok(WaitOutcome::Awakened));
    }
    assert_eq!(gate.live_channels(), 0);
}

#[test]
fn interrupt_while_parked() {
    let _trace = test::trace_init();
    const KEY: EventKey = 3;

    let gate = Arc::new(Gate::new(()));
    let interrupt = Arc::new(Interrupt::new());
    let waiter = thread::spawn({
        let gate = gate.clone();
        let interrupt = interrupt.clone();
        move || {
            let mut guard = gate.lock();
            let outcome = guard.wait_interruptible(KEY, &interrupt);
            drop(guard);
            outcome
        }
    });

    await_condition("waiter to register", || gate.channel_waiters(KEY) == 1);
    interrupt.raise();

    assert_eq!(waiter.join().unwrap(), Ok(WaitOutcome::Interrupted));
    assert_eq!(gate.live_channels(), 0);
}

#[test]
fn try_lock_steals_pending_handoff() {
    let _trace = test::trace_init();
    let gate = Gate::new(());

    // Fabricate a release in flight: the gate is held by a phantom owner, a
    // successor has been designated, and another waiter sits in the queue
    // behind it.
    let successor = Arc::new(WaitSlot {
        thread: thread::current(),
    });
    let queued = Arc::new(WaitSlot {
        thread: thread::current(),
    });
    {
        let mut core = gate.core.lock();
        core.count -= 1;
        core.wait_queue.push_back(queued.clone());
        core.handoff = Some(successor.clone());
    }

    let stolen = gate.try_lock().expect("a pending hand-off must be stealable");
    {
        let core = gate.core.lock();
        assert!(core.handoff.is_none());
        assert_eq!(core.wait_queue.len(), 2);
        assert!(
            Arc::ptr_eq(&core.wait_queue[0], &successor),
            "the displaced successor must keep its head-of-queue position"
        );
        assert!(Arc::ptr_eq(&core.wait_queue[1], &queued));
    }

    // Unwind the fabricated state so the release below has nobody to wake.
    gate.core.lock().wait_queue.clear();
    drop(stolen);
    assert!(gate.try_lock().is_some());
}

#[test]
fn contended_counter() {
    let _trace = test::trace_init();
    const THREADS: usize = 8;
    const INCREMENTS: usize = 100;

    let gate = Arc::new(Gate::new(0usize));
    let joins: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn({
                let gate = gate.clone();
                move || {
                    for _ in 0..INCREMENTS {
                        *gate.lock() += 1;
                    }
                }
            })
        })
        .collect();

    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(*gate.lock(), THREADS * INCREMENTS);
}

#[test]
fn ring_buffer_handshake() {
    let _trace = test::trace_init();
    const DATA_READY: EventKey = 1;
    const SPACE_READY: EventKey = 2;
    const CAPACITY: usize = 4;
    const ITEMS: u32 = 100;

    let gate = Arc::new(Gate::new(VecDeque::with_capacity(CAPACITY)));

    let producer = thread::spawn({
        let gate = gate.clone();
        move || {
            for item in 0..ITEMS {
                let mut buf = gate.lock();
                while buf.len() == CAPACITY {
                    buf.wait(SPACE_READY).unwrap();
                }
                buf.push_back(item);
                drop(buf);
                gate.wake_all(DATA_READY);
            }
        }
    });

    let consumer = thread::spawn({
        let gate = gate.clone();
        move || {
            let mut received = Vec::with_capacity(ITEMS as usize);
            while received.len() < ITEMS as usize {
                let mut buf = gate.lock();
                while buf.is_empty() {
                    buf.wait(DATA_READY).unwrap();
                }
                received.push(buf.pop_front().unwrap());
                drop(buf);
                gate.wake_all(SPACE_READY);
            }
            received
        }
    });

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
    assert_eq!(gate.live_channels(), 0);
}
