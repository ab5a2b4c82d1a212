//! One cell of the MPMC ring.
//!
//! A slot is a 16-byte atomic cell holding the element's raw bits and the
//! generation tag together:
//!
//! ```text
//! ┌───────────────────────────┬───────────────────────────┐
//! │ tag (high 64)             │ value bits (low 64)       │
//! └───────────────────────────┴───────────────────────────┘
//! ```
//!
//! Loading and exchanging the pair as one unit is what makes the handshake
//! tear-free: a consumer that observes a producer's tag observes its value
//! in the same instruction, and a producer that overwrites a drained slot
//! erases the prior consumer's footprint in one step.
//!
//! Next to the cell sits a 32-bit wake sequence. Futexes compare one 32-bit
//! word, and the tag has to stay inside the cell, so sleepers wait on the
//! sequence instead: a handoff that displaces a waiting-marked tag bumps the
//! sequence before waking. Waiters snapshot the sequence before their final
//! pairing re-check, so a handoff that lands in between turns the sleep into
//! an immediate return rather than a missed wakeup.

use core::sync::atomic::{AtomicU32, Ordering};

use portable_atomic::AtomicU128;

use super::tag::Tag;

#[inline]
fn pack(value: u64, tag: Tag) -> u128 {
    (u128::from(tag.raw()) << 64) | u128::from(value)
}

#[inline]
fn unpack(cell: u128) -> (u64, Tag) {
    (cell as u64, Tag::new((cell >> 64) as u64))
}

/// A single ring cell: the atomic `(value, tag)` pair and its wake word.
#[repr(C)]
pub(crate) struct Slot {
    cell: AtomicU128,
    wake: AtomicU32,
}

impl Slot {
    pub(crate) fn new(tag: Tag) -> Self {
        Self {
            cell: AtomicU128::new(pack(0, tag)),
            wake: AtomicU32::new(0),
        }
    }

    /// Loads the `(value bits, tag)` pair.
    #[inline]
    pub(crate) fn load(&self) -> (u64, Tag) {
        unpack(self.cell.load(Ordering::Acquire))
    }

    /// Publishes `(value bits, tag)` and returns the displaced pair.
    ///
    /// The caller must inspect the displaced tag's waiting bit and call
    /// [`wake_all`](Slot::wake_all) if it is set.
    #[inline]
    pub(crate) fn exchange(&self, value: u64, tag: Tag) -> (u64, Tag) {
        unpack(self.cell.swap(pack(value, tag), Ordering::AcqRel))
    }

    /// Tries to set the waiting bit on the observed `(value, tag)` pair.
    ///
    /// Fails if the cell changed since it was observed; the caller re-reads
    /// and re-checks pairing.
    #[inline]
    pub(crate) fn try_mark_waiting(&self, value: u64, tag: Tag) -> bool {
        self.cell
            .compare_exchange(
                pack(value, tag),
                pack(value, tag.with_waiting()),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Snapshot of the wake sequence, taken before a waiter's final pairing
    /// re-check.
    #[inline]
    pub(crate) fn wake_seq(&self) -> u32 {
        self.wake.load(Ordering::Acquire)
    }

    /// Blocks until the wake sequence differs from `seq` (or spuriously).
    #[inline]
    pub(crate) fn wait(&self, seq: u32) {
        atomic_wait::wait(&self.wake, seq);
    }

    /// Wakes every thread sleeping on this slot.
    #[cold]
    pub(crate) fn wake_all(&self) {
        self.wake.fetch_add(1, Ordering::Release);
        atomic_wait::wake_all(&self.wake);
    }
}
