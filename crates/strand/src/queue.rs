//! Bounded single-producer/single-consumer ring queue
//!
//! Fixed power-of-two capacity, two atomic cursors, no allocation or
//! blocking on push/pop. The queue is full when the slot after `tail` is
//! `head`, so a ring of `size` slots holds `size - 1` items.
//!
//! At most one thread may be inside `push` and at most one inside `pop` at
//! any instant. The producer role may migrate between threads (the
//! scheduler owner changes), provided each hand-over is ordered by some
//! other synchronization. Overlapping producers (or consumers) trip an
//! assertion instead of corrupting the ring.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Marks one side of the ring as busy for the duration of an operation.
struct RoleGuard<'a>(&'a AtomicBool);

impl<'a> RoleGuard<'a> {
    fn enter(flag: &'a AtomicBool, role: &str) -> Self {
        let busy = flag.swap(true, Ordering::Acquire);
        assert!(!busy, "ring queue: concurrent {}", role);
        RoleGuard(flag)
    }
}

impl Drop for RoleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounded SPSC ring queue
pub struct RingQueue<T> {
    mask: usize,
    /// Next slot to read (owned by the consumer)
    head: CachePadded<AtomicUsize>,
    /// Next slot to write (owned by the producer)
    tail: CachePadded<AtomicUsize>,
    producer: AtomicBool,
    consumer: AtomicBool,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots are only touched by the single producer (writes at `tail`) and the
// single consumer (reads at `head`); the cursors publish them.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a ring of `size` slots.
    ///
    /// # Panics
    ///
    /// `size` must be a power of two and at least 2.
    pub fn new(size: usize) -> Self {
        assert!(
            size >= 2 && size.is_power_of_two(),
            "ring queue size must be a power of two >= 2, got {}",
            size
        );
        let slots = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: size - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            producer: AtomicBool::new(false),
            consumer: AtomicBool::new(false),
            slots,
        }
    }

    #[inline]
    fn position(&self, p: usize) -> usize {
        p & self.mask
    }

    /// Enqueue `value`; gives it back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let _role = RoleGuard::enter(&self.producer, "producers");
        let tail = self.tail.load(Ordering::Relaxed);
        if self.position(tail + 1) == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        // SAFETY: slot `tail` is outside [head, tail) so the consumer does
        // not read it, and we are the only producer.
        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(self.position(tail + 1), Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest value.
    pub fn pop(&self) -> Option<T> {
        let _role = RoleGuard::enter(&self.consumer, "consumers");
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: slot `head` was initialized by a push that published it
        // through the Release store of `tail`.
        let value = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store(self.position(head + 1), Ordering::Release);
        Some(value)
    }

    /// Number of queued values (a snapshot when the other side is active)
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of values the ring can hold
    pub fn capacity(&self) -> usize {
        self.mask
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
