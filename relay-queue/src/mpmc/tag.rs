//! The slot generation tag.
//!
//! A tag is one 64-bit word with three fields:
//!
//! ```text
//! ┌───────┬─────────┬──────────────────────────────────────┐
//! │ 63    │ 62      │ 61..0                                │
//! │ role  │ waiting │ generation (low bits index the ring) │
//! └───────┴─────────┴──────────────────────────────────────┘
//! ```
//!
//! Role 0 is a producer, 1 a consumer. The waiting bit marks a slot that has
//! at least one thread asleep on it; whoever next exchanges the slot must
//! wake them. The generation pairs each producer lap with the consumer lap
//! that last drained the slot.

use core::fmt;

/// Ticket stride. A stride of one cache line's worth of slots would put
/// adjacent tickets on separate lines, but it has not shown a win in
/// benchmarks.
pub(crate) const INCREMENT: u64 = 1;

/// A slot generation tag. See the module docs for the bit layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(u64);

impl Tag {
    const CONSUMER: u64 = 1 << 63;
    const WAITING: u64 = 1 << 62;
    const VALUE_MASK: u64 = Self::WAITING - 1;

    #[inline]
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    /// The generation value, with both flag bits cleared.
    #[inline]
    pub(crate) fn value(self) -> u64 {
        self.0 & Self::VALUE_MASK
    }

    /// The ring index this tag claims. `mask` is `capacity - 1`.
    #[inline]
    pub(crate) fn index(self, mask: u64) -> usize {
        (self.0 & mask) as usize
    }

    /// The tag stored by the operation this claimant must pair with.
    ///
    /// A consumer of generation `g` pairs with the producer of generation
    /// `g`; a producer of generation `g` pairs with the consumer of
    /// generation `g - wrap`, the one that last drained this slot. `wrap` is
    /// `capacity * INCREMENT`.
    #[inline]
    pub(crate) fn prev_paired(self, wrap: u64) -> Self {
        if self.is_consumer() {
            Self((self.0 ^ Self::CONSUMER) & !Self::WAITING)
        } else {
            Self((self.0.wrapping_sub(wrap) ^ Self::CONSUMER) & !Self::WAITING)
        }
    }

    /// Whether `observed`, as read from the slot, completes this claimant's
    /// pairing. The waiting bit on the observed tag is ignored.
    #[inline]
    pub(crate) fn is_paired(self, observed: Self, wrap: u64) -> bool {
        self.prev_paired(wrap).0 == observed.0 & !Self::WAITING
    }

    #[inline]
    pub(crate) fn is_producer(self) -> bool {
        self.0 & Self::CONSUMER == 0
    }

    #[inline]
    pub(crate) fn is_consumer(self) -> bool {
        self.0 & Self::CONSUMER != 0
    }

    #[inline]
    pub(crate) fn as_consumer(self) -> Self {
        Self(self.0 | Self::CONSUMER)
    }

    #[inline]
    pub(crate) fn is_waiting(self) -> bool {
        self.0 & Self::WAITING != 0
    }

    #[inline]
    pub(crate) fn with_waiting(self) -> Self {
        Self(self.0 | Self::WAITING)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag<{}{}>{{{}}}",
            if self.is_producer() { 'P' } else { 'C' },
            if self.is_waiting() { "|W" } else { "" },
            self.value(),
        )
    }
}
