//! Multi-producer single-consumer (MPSC) bounded queue, try-only.
//!
//! Producers and the consumer coordinate through a single atomic word
//! packing both ring cursors:
//!
//! ```text
//! ┌───────────────────────────┬───────────────────────────┐
//! │ tail (high 32)            │ head (low 32)             │
//! └───────────────────────────┴───────────────────────────┘
//! ```
//!
//! Claiming a slot is one compare-and-swap on that word; the queue is empty
//! when the halves are equal, and one slot is always kept empty so that
//! full and empty stay distinguishable.
//!
//! The buffer cells are plain atomic words where zero means "no value yet".
//! A producer that wins a slot deposits by swapping its value in over the
//! expected zero; a consumer drains by swapping zero in and keeping what
//! came out. Either side spins only while its counterpart holds this same
//! slot mid-operation. That zero sentinel is load-bearing: **producers must
//! never push a value whose bits are all zero** (see [`ZeroableAtom`]).
//!
//! # Consumers, plural
//!
//! With a single consumer the queue is FIFO. Extra consumers do not lose or
//! duplicate values (every claimed slot drains exactly once), but two
//! consumers can commit adjacent pops out of order. Run one consumer unless
//! you know you don't care.
//!
//! # Example
//!
//! ```
//! use relay_queue::MpscQueue;
//! use std::thread;
//!
//! let queue = MpscQueue::<u64>::new(64);
//!
//! thread::scope(|s| {
//!     for p in 1..=4u64 {
//!         let queue = &queue;
//!         s.spawn(move || {
//!             for i in 0..100 {
//!                 let value = p * 1000 + i;
//!                 while queue.try_push(value).is_err() {
//!                     std::hint::spin_loop();
//!                 }
//!             }
//!         });
//!     }
//!
//!     let mut received = 0;
//!     while received < 400 {
//!         if queue.try_pop().is_some() {
//!             received += 1;
//!         }
//!     }
//! });
//! ```

use core::fmt;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{Full, ZeroableAtom};

/// Construction options for [`MpscQueue`].
///
/// # Example
///
/// ```
/// use relay_queue::{MpscQueue, QueueOpts};
///
/// let queue = MpscQueue::<u64>::with_opts(QueueOpts::default().set_max_size(100));
/// // Rounded up to the next power of two; one slot stays empty.
/// assert_eq!(queue.capacity(), 127);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct QueueOpts {
    max_size: usize,
}

impl QueueOpts {
    /// The buffer size hint.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Sets the buffer size hint; rounded up to the next power of two at
    /// construction.
    pub fn set_max_size(mut self, val: usize) -> Self {
        self.max_size = val;
        self
    }
}

impl Default for QueueOpts {
    fn default() -> Self {
        // One destructive-interference span of slots.
        Self { max_size: 128 }
    }
}

#[inline]
fn split(line: u64) -> (u32, u32) {
    (line as u32, (line >> 32) as u32)
}

#[inline]
fn join(head: u32, tail: u32) -> u64 {
    (u64::from(tail) << 32) | u64::from(head)
}

#[inline]
fn occupancy(line: u64, len: usize) -> usize {
    let (head, tail) = split(line);
    let (head, tail) = (head as usize, tail as usize);
    if tail < head {
        tail + len - head
    } else {
        tail - head
    }
}

/// A fixed-capacity MPSC queue.
///
/// All operations are non-blocking (`try_*`); a brief spin can occur only
/// when the direct counterpart of one specific slot is mid-operation. See
/// the [module docs](self) for the protocol and the zero-sentinel rule.
///
/// # Example
///
/// ```
/// use relay_queue::MpscQueue;
///
/// let queue = MpscQueue::<u32>::new(8);
///
/// queue.try_push(1).unwrap();
/// queue.try_push(2).unwrap();
///
/// assert_eq!(queue.len(), 2);
/// assert_eq!(queue.try_pop(), Some(1));
/// assert_eq!(queue.try_pop(), Some(2));
/// assert_eq!(queue.try_pop(), None);
/// ```
pub struct MpscQueue<T: ZeroableAtom> {
    /// Packed `(head, tail)` cursors, always advanced together by CAS.
    ht: CachePadded<AtomicU64>,
    buffer: CachePadded<Box<[AtomicU64]>>,
    _marker: PhantomData<T>,
}

// Safety: all shared state is atomic; elements cross threads as raw bits,
// so `T: Send` is required and sufficient.
unsafe impl<T: ZeroableAtom + Send> Send for MpscQueue<T> {}
unsafe impl<T: ZeroableAtom + Send> Sync for MpscQueue<T> {}

impl<T: ZeroableAtom> MpscQueue<T> {
    /// Compile-time assertion that `T` fits a slot; box larger payloads and
    /// push the pointer.
    const _ASSERT_WORD: () = assert!(
        core::mem::size_of::<T>() <= 8,
        "elements must fit in a machine word"
    );

    /// Creates a queue that holds `max_size.next_power_of_two() - 1`
    /// elements.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0 or rounds past `2^31` slots.
    pub fn new(max_size: usize) -> Self {
        Self::with_opts(QueueOpts::default().set_max_size(max_size))
    }

    /// Creates a queue from [`QueueOpts`].
    pub fn with_opts(opts: QueueOpts) -> Self {
        let _ = Self::_ASSERT_WORD;

        assert!(opts.max_size() > 0, "max_size must be non-zero");
        let len = opts.max_size().next_power_of_two().max(2);
        assert!(len <= 1 << 31, "buffer too large for 32-bit cursors");

        let mut buffer = Vec::with_capacity(len);
        buffer.resize_with(len, || AtomicU64::new(0));

        Self {
            ht: CachePadded::new(AtomicU64::new(join(0, 0))),
            buffer: CachePadded::new(buffer.into_boxed_slice()),
            _marker: PhantomData,
        }
    }

    /// Attempts to add an element.
    ///
    /// Claims a slot by advancing the packed tail, then deposits the value
    /// over the zero sentinel. The deposit spins only while a straggling
    /// consumer still holds this exact slot mid-drain.
    ///
    /// The value must not encode to the all-zero bit pattern; see
    /// [`ZeroableAtom`].
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue was observed full.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_queue::MpscQueue;
    ///
    /// let queue = MpscQueue::<u32>::new(2);
    ///
    /// queue.try_push(1).unwrap();
    /// assert!(queue.try_push(2).is_err()); // one slot always stays empty
    /// ```
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        let mut observed = 0;
        self.try_push_with_len(value, &mut observed)
    }

    /// Attempts to add an element and reports the observed occupancy.
    ///
    /// On success `len` holds the number of elements including the new one;
    /// on [`Full`] it holds the occupancy that caused the rejection. Useful
    /// for callers that size worker pools off queue depth without paying a
    /// second load.
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue was observed full.
    pub fn try_push_with_len(&self, value: T, len: &mut usize) -> Result<(), Full<T>> {
        let raw = value.into_raw();
        debug_assert!(raw != 0, "zero is reserved as the empty-slot sentinel");

        let buf_len = self.buffer.len();
        let mut line = self.ht.load(Ordering::Acquire);
        let claimed;

        loop {
            let occupied = occupancy(line, buf_len);
            if occupied == self.capacity() {
                *len = occupied;
                return Err(Full(value));
            }
            *len = occupied + 1;

            let (head, tail) = split(line);
            let new_tail = if tail as usize == buf_len - 1 { 0 } else { tail + 1 };

            match self.ht.compare_exchange_weak(
                line,
                join(head, new_tail),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    claimed = tail as usize;
                    break;
                }
                Err(current) => line = current,
            }
        }

        // A pop may have claimed this index without finishing its drain yet;
        // the sentinel only reads zero once it has.
        let cell = &self.buffer[claimed];
        let backoff = Backoff::new();
        while cell
            .compare_exchange_weak(0, raw, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            backoff.spin();
        }

        Ok(())
    }

    /// Attempts to remove the oldest element.
    ///
    /// Returns `None` if the queue was observed empty. Spins only while the
    /// producer that owns the claimed slot is mid-deposit.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_queue::MpscQueue;
    ///
    /// let queue = MpscQueue::<u32>::new(8);
    /// assert_eq!(queue.try_pop(), None);
    ///
    /// queue.try_push(7).unwrap();
    /// assert_eq!(queue.try_pop(), Some(7));
    /// ```
    pub fn try_pop(&self) -> Option<T> {
        let claimed = self.claim_pop_index()?;

        // The producer may have claimed this index without depositing yet,
        // in which case the swap keeps returning the sentinel.
        let cell = &self.buffer[claimed];
        let backoff = Backoff::new();
        loop {
            let raw = cell.swap(0, Ordering::AcqRel);
            if raw != 0 {
                return Some(T::from_raw(raw));
            }
            backoff.spin();
        }
    }

    /// Returns the number of elements in the queue.
    ///
    /// Both cursors come from one atomic load, so the count is exact at the
    /// load instant.
    pub fn len(&self) -> usize {
        occupancy(self.ht.load(Ordering::Acquire), self.buffer.len())
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity: one less than the rounded-up buffer size.
    pub fn capacity(&self) -> usize {
        self.buffer.len() - 1
    }

    /// Advances the packed head past the oldest element, returning the
    /// claimed index, or `None` if the queue was observed empty.
    fn claim_pop_index(&self) -> Option<usize> {
        let buf_len = self.buffer.len();
        let mut line = self.ht.load(Ordering::Acquire);

        loop {
            if occupancy(line, buf_len) == 0 {
                return None;
            }

            let (head, tail) = split(line);
            let new_head = if head as usize == buf_len - 1 { 0 } else { head + 1 };

            match self.ht.compare_exchange_weak(
                line,
                join(new_head, tail),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(head as usize),
                Err(current) => line = current,
            }
        }
    }
}

impl<T: ZeroableAtom> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // Drain whatever is still in flight so pointer-valued elements can
        // be collected by whoever owns the queue's teardown.
        while self.try_pop().is_some() {}
    }
}

impl<T: ZeroableAtom> fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
