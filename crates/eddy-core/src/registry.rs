//! Stream-to-queue registry.
//!
//! A fixed array of [`NUM_STREAMS`] input-queue slots. A slot is claimed
//! for a compute stream the first time that stream submits; slots are
//! published by a release store of the count and observed by acquire
//! loads, so a reader that sees `published == n` sees every stream key
//! written for slots below `n`. Slots are never reclaimed, which is what
//! makes the per-thread index cache sound.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::config::NUM_STREAMS;
use crate::op::{CollectiveOp, StreamId};
use crate::queue::SubmissionQueue;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Per-thread cache from (registry id, stream) to slot index. Keyed by
    /// registry id because slot indices are only meaningful within one
    /// registry's lifetime.
    static STREAM_CACHE: RefCell<FxHashMap<(u64, u64), usize>> =
        RefCell::new(FxHashMap::default());
}

/// One registry slot: a compute stream key and its input queue.
pub(crate) struct InputQueue {
    /// Raw stream key; valid once the slot index is below `published`.
    stream: AtomicU64,
    /// The per-stream FIFO of submitted descriptors.
    pub(crate) queue: SubmissionQueue,
    /// Serializes same-stream producers under multi-threaded submission.
    producer_lock: Mutex<()>,
}

impl InputQueue {
    fn new(depth: usize) -> Self {
        Self {
            stream: AtomicU64::new(0),
            queue: SubmissionQueue::with_capacity(depth),
            producer_lock: Mutex::new(()),
        }
    }

    /// The stream this slot serves.
    pub(crate) fn stream(&self) -> StreamId {
        StreamId(self.stream.load(Ordering::Relaxed))
    }
}

pub(crate) struct StreamRegistry {
    slots: Box<[InputQueue]>,
    published: AtomicUsize,
    add_lock: Mutex<()>,
    id: u64,
}

impl StreamRegistry {
    pub(crate) fn new(queue_depth: usize) -> Self {
        let slots: Vec<InputQueue> = (0..NUM_STREAMS).map(|_| InputQueue::new(queue_depth)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            published: AtomicUsize::new(0),
            add_lock: Mutex::new(()),
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The number of published slots. Every slot below this index has a
    /// fully initialized stream key.
    pub(crate) fn published(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn slot(&self, index: usize) -> &InputQueue {
        &self.slots[index]
    }

    /// Finds the slot serving `stream` within the published prefix.
    pub(crate) fn lookup(&self, stream: StreamId) -> Option<usize> {
        self.scan(0, self.published(), stream)
    }

    /// Finds the slot serving `stream`, claiming a new slot if none exists
    /// yet. Returns `None` when all [`NUM_STREAMS`] slots are claimed.
    pub(crate) fn lookup_or_create(&self, stream: StreamId) -> Option<usize> {
        let seen = self.published();
        if let Some(index) = self.scan(0, seen, stream) {
            return Some(index);
        }

        let _guard = self.add_lock.lock();
        // Another thread may have claimed the slot since the scan above;
        // only the delta needs re-checking.
        let now = self.published.load(Ordering::Acquire);
        if let Some(index) = self.scan(seen, now, stream) {
            return Some(index);
        }
        if now == self.slots.len() {
            return None;
        }
        self.slots[now].stream.store(stream.0, Ordering::Relaxed);
        self.published.store(now + 1, Ordering::Release);
        Some(now)
    }

    /// Pushes a descriptor onto the slot's queue.
    ///
    /// `serialize_producers` takes the slot's producer lock first, for
    /// configurations that allow concurrent submission on one stream.
    pub(crate) fn push(
        &self,
        index: usize,
        op: Box<dyn CollectiveOp>,
        serialize_producers: bool,
    ) -> Result<(), Box<dyn CollectiveOp>> {
        let slot = &self.slots[index];
        if serialize_producers {
            let _guard = slot.producer_lock.lock();
            slot.queue.push(op)
        } else {
            slot.queue.push(op)
        }
    }

    /// Probes this thread's cache for the slot serving `stream`.
    pub(crate) fn cached(&self, stream: StreamId) -> Option<usize> {
        STREAM_CACHE.with(|cache| cache.borrow().get(&(self.id, stream.0)).copied())
    }

    /// Records the slot serving `stream` in this thread's cache.
    pub(crate) fn remember(&self, stream: StreamId, index: usize) {
        STREAM_CACHE.with(|cache| {
            cache.borrow_mut().insert((self.id, stream.0), index);
        });
    }

    fn scan(&self, from: usize, to: usize, stream: StreamId) -> Option<usize> {
        (from..to).find(|&i| self.slots[i].stream.load(Ordering::Relaxed) == stream.0)
    }
}
