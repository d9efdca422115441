//! The gate's keyed event-channel table.
//!
//! Channels are created lazily by the waiting side, shared by concurrent
//! waits on the same key, and looked up (never created) by the waking side.
//! Table membership is governed by an explicit per-entry reference count: a
//! channel is present iff its count is nonzero, and the last operation to
//! release its reference unlinks it. Memory lifetime is governed separately
//! by [`Arc`], so a waker holding a channel whose entry has already been
//! unlinked can still touch it safely.
//!
//! The whole table lives inside the gate's core state and is only ever
//! manipulated while the gate's internal spinlock is held, which is why none
//! of these methods take a lock of their own.

use crate::{
    blocking::Mutex,
    loom::{
        sync::{
            atomic::{AtomicBool, Ordering::*},
            Arc,
        },
        thread::Thread,
    },
    util::fmt,
};

/// A key identifying an event channel on a [`Gate`](crate::Gate).
///
/// Keys are opaque to the gate; callers typically use the address of the
/// condition they are waiting on, or a small per-device enum cast to `usize`.
pub type EventKey = usize;

const BUCKET_BITS: u32 = 6;
const BUCKETS: usize = 1 << BUCKET_BITS;

// The 64-bit golden-ratio multiplier, for Fibonacci bucket hashing.
const GOLDEN_RATIO: u64 = 0x61c8_8646_80b5_83eb;

pub(super) struct EventRegistry {
    buckets: [Vec<Entry>; BUCKETS],
    len: usize,
    capacity: usize,
}

struct Entry {
    channel: Arc<EventChannel>,
    refs: usize,
}

pub(super) struct EventChannel {
    key: EventKey,
    pub(super) waiters: Mutex<Vec<Arc<ChannelWaiter>>>,
}

/// One blocked caller registered on an [`EventChannel`].
pub(super) struct ChannelWaiter {
    triggered: AtomicBool,
    thread: Thread,
}

// === impl EventRegistry ===

impl EventRegistry {
    loom_const_fn! {
        pub(super) fn new(capacity: usize) -> Self {
            Self {
                buckets: [const { Vec::new() }; BUCKETS],
                len: 0,
                capacity,
            }
        }
    }

    fn bucket(key: EventKey) -> usize {
        ((key as u64).wrapping_mul(GOLDEN_RATIO) >> (u64::BITS - BUCKET_BITS)) as usize
    }

    /// Returns the channel for `key`, creating it if necessary, and takes a
    /// reference on it.
    ///
    /// Returns [`None`] if a channel would have to be created and the table
    /// is already at capacity. Never blocks; callable under the gate's
    /// internal spinlock.
    pub(super) fn get_or_create(&mut self, key: EventKey) -> Option<Arc<EventChannel>> {
        let bucket = &mut self.buckets[Self::bucket(key)];
        if let Some(entry) = bucket.iter_mut().find(|entry| entry.channel.key == key) {
            entry.refs += 1;
            return Some(entry.channel.clone());
        }

        if self.len >= self.capacity {
            return None;
        }

        let channel = Arc::new(EventChannel {
            key,
            waiters: Mutex::new(Vec::new()),
        });
        bucket.push(Entry {
            channel: channel.clone(),
            refs: 1,
        });
        self.len += 1;
        trace!(key, channel = ?fmt::ptr(Arc::as_ptr(&channel)), "created event channel");
        Some(channel)
    }

    /// Returns the channel for `key` if one exists, taking a reference on it.
    /// Never creates.
    pub(super) fn lookup(&mut self, key: EventKey) -> Option<Arc<EventChannel>> {
        let entry = self.buckets[Self::bucket(key)]
            .iter_mut()
            .find(|entry| entry.channel.key == key)?;
        entry.refs += 1;
        Some(entry.channel.clone())
    }

    /// Drops one reference on `channel`, unlinking it from the table if this
    /// was the last one.
    ///
    /// Must be called exactly once per successful [`get_or_create`] or
    /// [`lookup`], on every exit path.
    ///
    /// [`get_or_create`]: Self::get_or_create
    /// [`lookup`]: Self::lookup
    pub(super) fn release(&mut self, channel: &Arc<EventChannel>) {
        let bucket = &mut self.buckets[Self::bucket(channel.key)];
        let idx = bucket
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.channel, channel));
        debug_assert!(idx.is_some(), "released a channel that is not in the table");
        let Some(idx) = idx else { return };

        bucket[idx].refs -= 1;
        if bucket[idx].refs == 0 {
            bucket.swap_remove(idx);
            self.len -= 1;
            trace!(
                key = channel.key,
                channel = ?fmt::ptr(Arc::as_ptr(channel)),
                "freed event channel",
            );
        }
    }

    /// The number of live channels, across all buckets.
    pub(super) fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// === impl EventChannel ===

impl EventChannel {
    /// Marks every currently registered waiter as triggered and unparks it.
    ///
    /// Waiters that are already awake (racing toward their recheck) simply
    /// observe the flag; parked ones are resumed by the unpark.
    pub(super) fn broadcast(&self) {
        let waiters = self.waiters.lock();
        trace!(key = self.key, waiters = waiters.len(), "broadcast");
        for waiter in waiters.iter() {
            waiter.triggered.store(true, Release);
            waiter.thread.unpark();
        }
    }

    #[cfg(test)]
    pub(super) fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

// === impl ChannelWaiter ===

impl ChannelWaiter {
    pub(super) fn new(thread: Thread) -> Self {
        Self {
            triggered: AtomicBool::new(false),
            thread,
        }
    }

    pub(super) fn is_triggered(&self) -> bool {
        self.triggered.load(Acquire)
    }
}
