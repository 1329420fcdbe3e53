//! The submitter-to-worker descriptor handoff queue.
//!
//! Every registry slot owns one [`SubmissionQueue`]: the single-producer
//! single-consumer FIFO that carries boxed collective descriptors from the
//! thread that called `enqueue` to the progress worker. The submitting
//! side only appends; the worker only inspects and takes the head, and it
//! takes a descriptor only after the admission rules have cleared it
//! (hence the `peek`-then-[`pop_always`](SubmissionQueue::pop_always)
//! shape of the consumer API).
//!
//! The handoff contract: everything the submitter wrote into a descriptor
//! before [`push`](SubmissionQueue::push) is visible to the worker once
//! `peek` returns that descriptor. `push` publishes the producer cursor
//! with Release ordering and the worker reads it with Acquire, which
//! carries the descriptor contents across the thread boundary.
//!
//! Producers of one stream are serialized externally: either by the
//! library's submission contract, or by the registry's per-slot producer
//! lock when multi-threaded submission is enabled.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::op::CollectiveOp;

/// A wrapper that pads a value to a cache line boundary to prevent false
/// sharing.
///
/// The two queue cursors are written by different threads; giving each its
/// own cache line keeps a submitting thread's stores from invalidating the
/// line the worker is polling.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

/// One ring slot holding a not-yet-admitted descriptor.
type Slot = UnsafeCell<MaybeUninit<Box<dyn CollectiveOp>>>;

/// A lock-free single-producer single-consumer FIFO of collective
/// descriptors.
///
/// The ring is indexed by two monotonically increasing cursors rather
/// than wrapped offsets: `filled` counts descriptors ever published and
/// `taken` counts descriptors the worker has removed. A slot at position
/// `n` lives at `n & mask`, the queue holds `filled - taken` descriptors,
/// and the full usable capacity is the ring size. Cursor wrap-around in
/// `usize` is harmless because only differences are ever inspected.
///
/// # Safety
///
/// Exactly one thread may call the producer API ([`push`](Self::push))
/// and exactly one the consumer API ([`peek`](Self::peek) /
/// [`pop_always`](Self::pop_always) / [`pop`](Self::pop)) at a time. In
/// the engine those are a serialized submitter and the single worker.
///
/// # Example
///
/// ```rust
/// use eddy_core::queue::SubmissionQueue;
/// use eddy_core::{CollectiveOp, RunType, StepAction, StreamId};
///
/// struct Fence(StreamId);
///
/// impl CollectiveOp for Fence {
///     fn run_type(&self) -> RunType { RunType::Unbounded }
///     fn stream(&self) -> StreamId { self.0 }
///     fn step(&mut self) -> StepAction { StepAction::Complete }
/// }
///
/// let queue = SubmissionQueue::with_capacity(8);
/// assert!(queue.push(Box::new(Fence(StreamId(3)))).is_ok());
/// assert_eq!(queue.peek().unwrap().stream(), StreamId(3));
/// let fence = queue.pop_always();
/// assert_eq!(fence.stream(), StreamId(3));
/// ```
pub struct SubmissionQueue {
    /// Ring storage; slot `n & mask` is owned by whichever side the
    /// cursors say it belongs to.
    slots: Box<[Slot]>,
    /// `ring size - 1`, for cheap position-to-slot mapping.
    mask: usize,
    /// Descriptors the worker has taken. Worker-written, Release.
    taken: CachePadded<AtomicUsize>,
    /// Descriptors published by the submitter. Producer-written, Release.
    filled: CachePadded<AtomicUsize>,
}

// SAFETY: the cursor protocol partitions slot ownership between exactly
// one producer thread and one consumer thread, and descriptors are Send,
// so the queue may be shared and sent across threads.
unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    /// Creates a queue holding up to `capacity` descriptors (rounded up
    /// to a power of two).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let size = capacity.next_power_of_two();

        let slots: Vec<Slot> = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: size - 1,
            taken: CachePadded::new(AtomicUsize::new(0)),
            filled: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// The number of descriptors the queue can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// The number of descriptors currently queued. A racing snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled
            .load(Ordering::Acquire)
            .wrapping_sub(self.taken.load(Ordering::Acquire))
    }

    /// Whether the queue is currently empty. A racing snapshot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submits a descriptor (producer side).
    ///
    /// # Errors
    ///
    /// Hands the descriptor back if the queue is full; the engine treats
    /// that as a fatal configuration error, never as flow control.
    pub fn push(&self, op: Box<dyn CollectiveOp>) -> Result<(), Box<dyn CollectiveOp>> {
        let filled = self.filled.load(Ordering::Relaxed);
        if filled.wrapping_sub(self.taken.load(Ordering::Acquire)) == self.capacity() {
            return Err(op);
        }

        // SAFETY: positions at and past `filled` belong to the producer,
        // and `filled` advances only through this function on the single
        // submitting thread, so nothing else can touch this slot. The
        // Acquire load above proves the worker has vacated it (its
        // position is at least a full ring behind the one being written).
        unsafe {
            (*self.slots[filled & self.mask].get()).write(op);
        }
        // Hand the slot to the worker; everything written to the
        // descriptor before this store is visible after a matching
        // Acquire load of `filled`.
        self.filled.store(filled.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Borrows the head descriptor so the worker can apply its admission
    /// rules, or `None` if nothing is queued. Consumer side.
    #[must_use]
    pub fn peek(&self) -> Option<&dyn CollectiveOp> {
        let taken = self.taken.load(Ordering::Relaxed);
        if self.filled.load(Ordering::Acquire) == taken {
            return None;
        }

        // SAFETY: `filled` is ahead of `taken`, so the head slot holds a
        // descriptor the producer fully initialized before its Release
        // store of `filled` (which the Acquire load above synchronizes
        // with). The producer never revisits positions below `filled`,
        // and only the worker advances `taken`, so the borrow stays valid
        // until the worker itself removes the descriptor.
        let op = unsafe { (*self.slots[taken & self.mask].get()).assume_init_ref() };
        Some(op.as_ref())
    }

    /// Removes the head descriptor after an admission decision. Consumer
    /// side.
    ///
    /// The contract is that the most recent [`peek`](Self::peek) returned
    /// `Some`; this removes exactly that descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty, which means the contract was broken.
    pub fn pop_always(&self) -> Box<dyn CollectiveOp> {
        match self.pop() {
            Some(op) => op,
            None => unreachable!("pop_always called without a successful peek"),
        }
    }

    /// Removes the head descriptor, or `None` if nothing is queued.
    /// Consumer side.
    pub fn pop(&self) -> Option<Box<dyn CollectiveOp>> {
        let taken = self.taken.load(Ordering::Relaxed);
        if self.filled.load(Ordering::Acquire) == taken {
            return None;
        }

        // SAFETY: same synchronization argument as `peek`. Moving the box
        // out leaves the slot logically uninitialized, which is exactly
        // what the Release store below tells the producer: the position is
        // free for reuse one ring-length later.
        let op = unsafe { (*self.slots[taken & self.mask].get()).assume_init_read() };
        self.taken.store(taken.wrapping_add(1), Ordering::Release);
        Some(op)
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        // Descriptors never admitted are dropped with the engine.
        while self.pop().is_some() {}
    }
}

impl std::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{RunType, StepAction, StreamId};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// A descriptor shaped like the engine's real traffic: a stream, a
    /// run type, an identity, and observable teardown.
    struct Probe {
        tag: String,
        stream: StreamId,
        run_type: RunType,
        dropped: Option<Arc<AtomicUsize>>,
    }

    impl Probe {
        fn boxed(id: u64, stream: StreamId) -> Box<Self> {
            Box::new(Self {
                tag: format!("d-{id}"),
                stream,
                run_type: RunType::Bounded,
                dropped: None,
            })
        }

        fn counted(id: u64, dropped: &Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                tag: format!("d-{id}"),
                stream: StreamId(1),
                run_type: RunType::Bounded,
                dropped: Some(Arc::clone(dropped)),
            })
        }
    }

    impl CollectiveOp for Probe {
        fn run_type(&self) -> RunType {
            self.run_type
        }

        fn stream(&self) -> StreamId {
            self.stream
        }

        fn step(&mut self) -> StepAction {
            StepAction::Complete
        }

        fn name(&self) -> &str {
            &self.tag
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            if let Some(counter) = &self.dropped {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_descriptors_hand_off_in_submission_order() {
        let queue = SubmissionQueue::with_capacity(8);
        for id in 0..6 {
            assert!(queue.push(Probe::boxed(id, StreamId(4))).is_ok());
        }
        assert_eq!(queue.len(), 6);

        for id in 0..6 {
            assert_eq!(queue.peek().unwrap().name(), format!("d-{id}"));
            let op = queue.pop_always();
            assert_eq!(op.name(), format!("d-{id}"));
            assert_eq!(op.stream(), StreamId(4));
        }
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_peek_inspects_without_taking() {
        let queue = SubmissionQueue::with_capacity(4);
        assert!(queue.peek().is_none());

        assert!(queue.push(Probe::boxed(7, StreamId(2))).is_ok());
        // The worker may peek the head repeatedly while admission defers.
        assert_eq!(queue.peek().unwrap().stream(), StreamId(2));
        assert_eq!(queue.peek().unwrap().run_type(), RunType::Bounded);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop_always().name(), "d-7");
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_full_queue_hands_the_descriptor_back() {
        let queue = SubmissionQueue::with_capacity(2);
        assert_eq!(queue.capacity(), 2);
        assert!(queue.push(Probe::boxed(0, StreamId(1))).is_ok());
        assert!(queue.push(Probe::boxed(1, StreamId(1))).is_ok());

        // The rejected submission comes back intact for the caller to
        // report, not silently dropped.
        let rejected = queue.push(Probe::boxed(2, StreamId(1))).unwrap_err();
        assert_eq!(rejected.name(), "d-2");

        // Draining one slot makes the next submission succeed.
        assert_eq!(queue.pop_always().name(), "d-0");
        assert!(queue.push(rejected).is_ok());
    }

    #[test]
    fn test_order_survives_cursor_wraparound() {
        // Refill-and-drain far past the ring size so the slot positions
        // wrap several times mid-stream.
        let queue = SubmissionQueue::with_capacity(4);
        let mut next_in = 0u64;
        let mut next_out = 0u64;
        while next_out < 20 {
            while next_in < next_out + 3 {
                assert!(queue.push(Probe::boxed(next_in, StreamId(1))).is_ok());
                next_in += 1;
            }
            while queue.peek().is_some() {
                assert_eq!(queue.pop_always().name(), format!("d-{next_out}"));
                next_out += 1;
            }
        }
    }

    #[test]
    #[should_panic(expected = "pop_always called without a successful peek")]
    fn test_pop_always_requires_a_queued_descriptor() {
        let queue = SubmissionQueue::with_capacity(4);
        let _ = queue.pop_always();
    }

    #[test]
    fn test_undrained_descriptors_drop_with_the_queue() {
        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let queue = SubmissionQueue::with_capacity(8);
            for id in 0..3 {
                assert!(queue.push(Probe::counted(id, &dropped)).is_ok());
            }
            // One admitted and destroyed by the caller, two left queued.
            drop(queue.pop());
            assert_eq!(dropped.load(Ordering::SeqCst), 1);
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_capacity_rounds_up() {
        let queue = SubmissionQueue::with_capacity(5);
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_rejected() {
        let _ = SubmissionQueue::with_capacity(0);
    }
}
