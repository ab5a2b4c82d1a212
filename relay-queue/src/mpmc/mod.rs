//! Multi-producer multi-consumer (MPMC) bounded queue.
//!
//! Any number of threads may push and pop concurrently. Delivery is FIFO:
//! the order in which producer tickets are drawn is the order in which
//! consumers receive the values.
//!
//! # Claim and Handshake
//!
//! Two cache-padded counters dispense tickets: `tail` to producers, `head`
//! to consumers. A ticket's low bits pick a ring slot; the rest of the
//! ticket is the generation, which says which lap around the ring the
//! operation belongs to. Each slot stores its current generation tag next
//! to the value in one 16-byte atomic cell, so the handoff is a single
//! exchange:
//!
//! ```text
//! producer of generation g        consumer of generation g
//! ──────────────────────────      ─────────────────────────
//! wait for tag C(g - N)           wait for tag P(g)
//! exchange in (v, P(g))           exchange in (0, C(g))
//!                                 return v
//! ```
//!
//! A claimant whose counterpart has not arrived spins briefly, then sets
//! the waiting bit on the slot's tag and sleeps on the slot. Whoever
//! displaces a waiting-marked tag wakes all sleepers on that slot, so the
//! wake syscall is only paid when someone actually went to sleep.
//!
//! # Example
//!
//! ```
//! use relay_queue::MpmcQueue;
//! use std::thread;
//!
//! let queue = MpmcQueue::<u64, 256>::new();
//!
//! thread::scope(|s| {
//!     for p in 0..4u64 {
//!         let queue = &queue;
//!         s.spawn(move || {
//!             for i in 0..100 {
//!                 queue.push(p * 1000 + i);
//!             }
//!         });
//!     }
//!
//!     let mut received = 0;
//!     while received < 400 {
//!         queue.pop();
//!         received += 1;
//!     }
//! });
//! ```
//!
//! # Element Size
//!
//! Elements live inside the slot cell and must fit a machine word; see
//! [`Atom`]. Wider payloads go through a pointer
//! (`NonNull<Payload>`) to heap storage. The slot layout does not widen.

mod slot;
mod tag;

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{Atom, Full};
use slot::Slot;
use tag::{Tag, INCREMENT};

/// A fixed-capacity MPMC queue.
///
/// `N` must be a power of two (enforced at compile time), and `T` must fit
/// in a machine word (likewise). All operations take `&self`; share the
/// queue by reference or inside an `Arc`.
///
/// # Example
///
/// ```
/// use relay_queue::MpmcQueue;
///
/// let queue = MpmcQueue::<u32, 4>::new();
///
/// queue.push(1);
/// queue.push(2);
///
/// assert_eq!(queue.len(), 2);
/// assert_eq!(queue.pop(), 1);
/// assert_eq!(queue.pop(), 2);
/// assert_eq!(queue.try_pop(), None);
/// ```
#[repr(C)]
pub struct MpmcQueue<T: Atom, const N: usize> {
    /// Ticket dispenser for consumers.
    head: CachePadded<AtomicU64>,
    /// Ticket dispenser for producers.
    tail: CachePadded<AtomicU64>,
    buffer: [Slot; N],
    _marker: PhantomData<T>,
}

// Safety: all shared state is atomic; elements cross threads as raw bits,
// so `T: Send` is required and sufficient.
unsafe impl<T: Atom + Send, const N: usize> Send for MpmcQueue<T, N> {}
unsafe impl<T: Atom + Send, const N: usize> Sync for MpmcQueue<T, N> {}

impl<T: Atom, const N: usize> MpmcQueue<T, N> {
    const MASK: u64 = N as u64 - 1;
    const WRAP: u64 = N as u64 * INCREMENT;

    /// Compile-time assertion that `N` is a power of two.
    const _ASSERT_POW2: () = assert!(N > 0 && N & (N - 1) == 0, "capacity must be a power of two");

    /// Compile-time assertion that `T` fits a slot; box larger payloads and
    /// push the pointer.
    const _ASSERT_WORD: () = assert!(
        mem::size_of::<T>() <= 8,
        "elements must fit in a machine word"
    );

    /// Creates an empty queue.
    ///
    /// Every slot starts tagged as drained by the (virtual) consumer of the
    /// lap before generation counting begins, so the first producer on each
    /// slot finds its pairing already complete.
    pub fn new() -> Self {
        // Force the compile-time assertions to be evaluated
        let _ = Self::_ASSERT_POW2;
        let _ = Self::_ASSERT_WORD;

        Self {
            head: CachePadded::new(AtomicU64::new(Self::WRAP)),
            tail: CachePadded::new(AtomicU64::new(Self::WRAP)),
            buffer: core::array::from_fn(|i| {
                Slot::new(Tag::new(i as u64 * INCREMENT).as_consumer())
            }),
            _marker: PhantomData,
        }
    }

    /// Adds an element, blocking while the queue is full.
    ///
    /// The calling thread draws a producer ticket immediately; if the
    /// ticket's slot still holds an undrained value from the previous lap,
    /// the thread spins briefly and then sleeps until the consumer of that
    /// lap hands the slot over. There is no timeout; use
    /// [`try_push`](Self::try_push) for callers that must not block.
    pub fn push(&self, value: T) {
        let tag = Tag::new(self.tail.fetch_add(INCREMENT, Ordering::AcqRel));
        self.deposit(value.into_raw(), tag);
    }

    /// Attempts to add an element without blocking.
    ///
    /// The claim compares candidate tickets against a snapshot of the head
    /// cursor taken at entry, so one call does a bounded amount of work: a
    /// ticket that would run a full lap ahead of the snapshot reports
    /// [`Full`] instead of waiting. A pop that races in after the snapshot
    /// is picked up by the *next* call, not this one.
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue was observed full.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_queue::MpmcQueue;
    ///
    /// let queue = MpmcQueue::<u32, 2>::new();
    ///
    /// queue.push(1);
    /// queue.push(2);
    /// assert!(queue.try_push(3).is_err());
    /// ```
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        let head = self.head.load(Ordering::Acquire);
        let mut expected = head;

        loop {
            match self.tail.compare_exchange_weak(
                expected,
                expected.wrapping_add(INCREMENT),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.deposit(value.into_raw(), Tag::new(expected));
                    return Ok(());
                }
                Err(current) => {
                    let desired = current.wrapping_add(INCREMENT);
                    if desired >= head.wrapping_add(Self::WRAP) {
                        return Err(Full(value));
                    }
                    expected = current;
                }
            }
        }
    }

    /// Removes the oldest element, blocking while the queue is empty.
    ///
    /// Symmetric to [`push`](Self::push): the consumer ticket is drawn
    /// immediately and the thread waits on its slot until the producer of
    /// the same generation deposits.
    pub fn pop(&self) -> T {
        let tag = Tag::new(self.head.fetch_add(INCREMENT, Ordering::AcqRel)).as_consumer();
        T::from_raw(self.drain(tag))
    }

    /// Attempts to remove the oldest element without blocking.
    ///
    /// Returns `None` if the queue was observed empty.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_queue::MpmcQueue;
    ///
    /// let queue = MpmcQueue::<u32, 4>::new();
    /// assert_eq!(queue.try_pop(), None);
    ///
    /// queue.push(7);
    /// assert_eq!(queue.try_pop(), Some(7));
    /// ```
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Acquire);
        let mut expected = tail.wrapping_sub(INCREMENT);

        loop {
            match self.head.compare_exchange_weak(
                expected,
                expected.wrapping_add(INCREMENT),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let tag = Tag::new(expected).as_consumer();
                    return Some(T::from_raw(self.drain(tag)));
                }
                Err(current) => {
                    let desired = current.wrapping_add(INCREMENT);
                    if desired > tail {
                        return None;
                    }
                    expected = current;
                }
            }
        }
    }

    /// Returns the number of elements in the queue.
    ///
    /// Best-effort under concurrency: the head cursor is read first, so a
    /// racing operation can make the result overshoot (even past
    /// `capacity()`), but it never wraps below zero. Consumers sizing a
    /// batch prefer that skew.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        (tail.wrapping_sub(head) / INCREMENT) as usize
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity (compile-time constant).
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Completes a producer claim: wait for the slot to drain, publish the
    /// value, wake any sleepers displaced along with the old tag.
    fn deposit(&self, value: u64, tag: Tag) {
        debug_assert!(tag.is_producer());
        debug_assert!(!tag.is_waiting());

        let slot = &self.buffer[tag.index(Self::MASK)];
        self.await_pairing(tag, slot);

        let (_, displaced) = slot.exchange(value, tag);
        if displaced.is_waiting() {
            slot.wake_all();
        }
    }

    /// Completes a consumer claim: wait for the slot to fill, take the
    /// value, leave the drained tag behind.
    fn drain(&self, tag: Tag) -> u64 {
        debug_assert!(tag.is_consumer());
        debug_assert!(!tag.is_waiting());

        let slot = &self.buffer[tag.index(Self::MASK)];
        self.await_pairing(tag, slot);

        let (value, displaced) = slot.exchange(0, tag);
        if displaced.is_waiting() {
            slot.wake_all();
        }

        value
    }

    /// Spins briefly, then sleeps on the slot until the claimant's
    /// counterpart hands the slot over.
    fn await_pairing(&self, claimed: Tag, slot: &Slot) {
        let backoff = Backoff::new();

        loop {
            let (value, observed) = slot.load();
            if claimed.is_paired(observed, Self::WRAP) {
                return;
            }

            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            // Park phase. Publish the waiting bit so the counterpart knows
            // to wake us, re-check pairing, then sleep. The wake sequence is
            // snapshotted before the re-check: a handoff that lands in
            // between bumps the sequence and the sleep returns immediately.
            if !observed.is_waiting() && !slot.try_mark_waiting(value, observed) {
                // Cell changed under us; re-examine.
                continue;
            }

            let seq = slot.wake_seq();
            let (_, current) = slot.load();
            if claimed.is_paired(current, Self::WRAP) {
                return;
            }

            slot.wait(seq);
        }
    }
}

impl<T: Atom, const N: usize> Default for MpmcQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Atom, const N: usize> Drop for MpmcQueue<T, N> {
    fn drop(&mut self) {
        // Drain whatever is still in flight so pointer-valued elements can
        // be collected by whoever owns the queue's teardown.
        while self.try_pop().is_some() {}
    }
}

impl<T: Atom, const N: usize> fmt::Debug for MpmcQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_thread_order() {
        let queue = MpmcQueue::<u64, 4>::new();

        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.push(4);

        assert_eq!(queue.len(), 4);
        assert!(queue.try_push(5).is_err());

        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
        assert_eq!(queue.pop(), 4);
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn wraparound() {
        let queue = MpmcQueue::<u64, 2>::new();

        queue.push(10);
        assert_eq!(queue.pop(), 10);
        queue.push(20);
        assert_eq!(queue.pop(), 20);

        queue.push(30);
        queue.push(40);
        assert!(queue.try_push(50).is_err());
        assert_eq!(queue.pop(), 30);
        assert_eq!(queue.pop(), 40);
    }

    #[test]
    fn generation_reuse() {
        // Many laps over a small ring must neither deadlock nor misorder.
        let queue = MpmcQueue::<u64, 4>::new();

        for lap in 0..100u64 {
            for i in 0..4 {
                queue.push(lap * 4 + i);
            }
            for i in 0..4 {
                assert_eq!(queue.pop(), lap * 4 + i);
            }
        }
    }

    #[test]
    fn try_push_bounds_work_against_head_snapshot() {
        let queue = MpmcQueue::<u64, 4>::new();

        // The try claim never runs a ticket a full lap past the head value
        // it snapshotted, so it reports full one slot shy of the blocking
        // path's limit.
        let mut accepted = 0u64;
        while queue.try_push(accepted).is_ok() {
            accepted += 1;
        }
        assert_eq!(accepted, 3);

        // A pop unblocks the next fresh call.
        assert_eq!(queue.try_pop(), Some(0));
        assert!(queue.try_push(99).is_ok());

        // The blocking path fills the ring completely.
        queue.push(100);
        assert_eq!(queue.len(), 4);
        assert!(queue.try_push(101).is_err());
    }

    #[test]
    fn len_counts_tickets() {
        let queue = MpmcQueue::<u64, 8>::new();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.capacity(), 8);

        for i in 0..5 {
            queue.push(i);
            assert_eq!(queue.len(), i as usize + 1);
        }
        for i in (0..5).rev() {
            queue.pop();
            assert_eq!(queue.len(), i as usize);
        }
    }

    #[test]
    fn blocking_handoff_wakes_sleeping_consumer() {
        let queue = MpmcQueue::<u64, 1>::new();

        thread::scope(|s| {
            let consumer = s.spawn(|| queue.pop());
            // Give the consumer time to pass the spin phase and sleep.
            thread::sleep(Duration::from_millis(50));
            queue.push(7);
            assert_eq!(consumer.join().unwrap(), 7);
        });
    }

    #[test]
    fn blocking_push_waits_for_drain() {
        let queue = MpmcQueue::<u64, 2>::new();
        queue.push(1);
        queue.push(2);

        thread::scope(|s| {
            let producer = s.spawn(|| queue.push(3));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(queue.pop(), 1);
            producer.join().unwrap();
        });

        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn many_to_many_stress() {
        const PRODUCERS: u64 = 8;
        const CONSUMERS: u64 = 8;
        const PER_PRODUCER: u64 = 25_000;
        const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

        let queue = MpmcQueue::<u64, 1024>::new();

        let mut received = thread::scope(|s| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                });
            }

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let queue = &queue;
                    s.spawn(move || {
                        let mut got = Vec::with_capacity((TOTAL / CONSUMERS) as usize);
                        for _ in 0..TOTAL / CONSUMERS {
                            got.push(queue.pop());
                        }
                        got
                    })
                })
                .collect();

            consumers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        // Every pushed value arrives exactly once.
        received.sort_unstable();
        assert_eq!(received.len() as u64, TOTAL);
        for (i, v) in received.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    #[test]
    fn try_pop_contention_exact_once() {
        const TOTAL: u64 = 40_000;
        const CONSUMERS: usize = 4;

        let queue = MpmcQueue::<u64, 256>::new();
        let popped = AtomicU64::new(0);

        let mut received = thread::scope(|s| {
            {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..TOTAL {
                        while queue.try_push(i).is_err() {
                            std::hint::spin_loop();
                        }
                    }
                });
            }

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let queue = &queue;
                    let popped = &popped;
                    s.spawn(move || {
                        let mut got = Vec::new();
                        loop {
                            match queue.try_pop() {
                                Some(v) => {
                                    got.push(v);
                                    popped.fetch_add(1, Ordering::Relaxed);
                                }
                                None if popped.load(Ordering::Relaxed) >= TOTAL => break,
                                None => std::hint::spin_loop(),
                            }
                        }
                        got
                    })
                })
                .collect();

            consumers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        received.sort_unstable();
        assert_eq!(received.len() as u64, TOTAL);
        for (i, v) in received.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    #[test]
    fn pointer_payloads() {
        use std::ptr::NonNull;

        let queue = MpmcQueue::<NonNull<u64>, 4>::new();

        let a = NonNull::from(Box::leak(Box::new(11u64)));
        let b = NonNull::from(Box::leak(Box::new(22u64)));
        queue.push(a);
        queue.push(b);

        let first = queue.pop();
        let second = queue.pop();
        // SAFETY: both pointers come from the leaked boxes pushed above.
        assert_eq!(unsafe { *first.as_ref() }, 11);
        // SAFETY: as above.
        assert_eq!(unsafe { *second.as_ref() }, 22);

        // SAFETY: popped exactly once, so each box is reclaimed exactly once.
        unsafe {
            drop(Box::from_raw(first.as_ptr()));
            drop(Box::from_raw(second.as_ptr()));
        }
    }

    #[test]
    fn drop_drains_in_flight_elements() {
        let queue = MpmcQueue::<u64, 8>::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        drop(queue);
    }

    #[test]
    fn debug_output() {
        let queue = MpmcQueue::<u64, 8>::new();
        queue.push(5);
        let rendered = format!("{queue:?}");
        assert!(rendered.contains("capacity: 8"));
        assert!(rendered.contains("len: 1"));
    }
}
