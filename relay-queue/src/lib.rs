//! Fixed-capacity lock-free queues for passing work between threads.
//!
//! `relay-queue` provides two bounded queues for latency-critical work
//! distribution inside a single process:
//!
//! - [`MpmcQueue`]: multi-producer multi-consumer, FIFO, with blocking
//!   `push`/`pop` backed by futex-style per-slot waits.
//! - [`MpscQueue`]: multi-producer single-consumer, try-only, non-blocking.
//!
//! # Quick Start
//!
//! ```
//! use relay_queue::MpmcQueue;
//!
//! let queue = MpmcQueue::<u64, 1024>::new();
//!
//! queue.push(42);
//! assert_eq!(queue.pop(), 42);
//! ```
//!
//! # Element Types
//!
//! Both queues store elements directly inside atomic words, so elements must
//! be plain word-sized values; see [`Atom`]. For anything larger, push a
//! pointer to heap storage instead:
//!
//! ```
//! use std::ptr::NonNull;
//! use relay_queue::MpscQueue;
//!
//! let queue = MpscQueue::<NonNull<String>>::new(64);
//!
//! let boxed = NonNull::from(Box::leak(Box::new("hello".to_string())));
//! queue.try_push(boxed).unwrap();
//!
//! let out = queue.try_pop().unwrap();
//! assert_eq!(*unsafe { Box::from_raw(out.as_ptr()) }, "hello");
//! ```
//!
//! The MPSC queue additionally requires [`ZeroableAtom`]: the all-zero bit
//! pattern is reserved to mean "slot empty" and **must never be pushed**.
//!
//! # Design
//!
//! Both queues wrap a fixed ring of slots. Producers and consumers draw
//! monotonically increasing tickets from shared counters; the ticket's low
//! bits select a slot, the rest identify which lap around the ring the
//! operation belongs to.
//!
//! ```text
//! MPMC slot (one 16-byte atomic cell):
//! ┌───────────────────────────┬───────────────────────────┐
//! │ value bits (64)           │ tag: role|waiting|lap (64)│
//! └───────────────────────────┴───────────────────────────┘
//!
//! MPSC cursors (one 8-byte atomic word):
//! ┌───────────────────────────┬───────────────────────────┐
//! │ tail (32)                 │ head (32)                 │
//! └───────────────────────────┴───────────────────────────┘
//! ```
//!
//! The MPMC queue pairs each producer lap with the consumer lap that last
//! drained its slot; a claimant that arrives early spins briefly and then
//! sleeps on the slot until its counterpart hands the slot over. The MPSC
//! queue advances both cursors through a single compare-and-swap word and
//! uses the zero sentinel to detect slots that are claimed but not yet
//! filled.
//!
//! Head and tail cursors live on separate cache lines
//! (`crossbeam_utils::CachePadded`) to keep producers and consumers from
//! false-sharing.
//!
//! # Picking a Queue
//!
//! - Many threads on both sides, or blocking semantics needed → [`MpmcQueue`]
//! - Many producers funneling into one worker, try-only → [`MpscQueue`]
//! - Single producer and single consumer → use an SPSC ring instead; both
//!   queues here pay for coordination you don't need

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::fmt;

mod atom;
pub mod mpmc;
pub mod mpsc;

pub use atom::{Atom, ZeroableAtom};
pub use mpmc::MpmcQueue;
pub use mpsc::{MpscQueue, QueueOpts};

/// The queue had no free slot for the pushed value.
///
/// The rejected value rides back inside the error, so the caller decides
/// whether to retry, spill, or drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Unwraps the rejected value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free slot in queue")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}
