//! Sequence number correlation.
//!
//! Each session owns one [`SequenceCorrelator`]. It hands out strictly
//! increasing numbers for locally originated messages and remembers the
//! highest number seen from the peer. Numbers are never reused, even when
//! the session reconnects.
//!
//! # Example
//!
//! ```
//! use crossfire_wire::SequenceCorrelator;
//!
//! let seq = SequenceCorrelator::new(1);
//! assert_eq!(seq.next_seq(), 1);
//! assert_eq!(seq.next_seq(), 2);
//!
//! seq.observe(7);
//! seq.observe(3);
//! assert_eq!(seq.last_seen(), Some(7));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "nothing observed yet".
const NONE_SEEN: u64 = u64::MAX;

/// Monotonic sequence allocator plus peer high-water mark.
#[derive(Debug)]
pub struct SequenceCorrelator {
    next: AtomicU64,
    last_seen: AtomicU64,
}

impl SequenceCorrelator {
    /// Create a correlator whose first assigned number is `first`.
    pub fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
            last_seen: AtomicU64::new(NONE_SEEN),
        }
    }

    /// Assign the next local sequence number.
    #[inline]
    pub fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number the next call to [`next_seq`](Self::next_seq) will return.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// Record a sequence number received from the peer.
    ///
    /// Returns `false` if it does not advance past the highest number seen
    /// so far. Out-of-order numbers are only logged.
    pub fn observe(&self, seq: u64) -> bool {
        if seq == NONE_SEEN {
            return false;
        }

        let prev = self
            .last_seen
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                if cur == NONE_SEEN || seq > cur {
                    Some(seq)
                } else {
                    None
                }
            });

        match prev {
            Ok(_) => true,
            Err(highest) => {
                tracing::debug!("Peer sequence {} does not advance past {}", seq, highest);
                false
            }
        }
    }

    /// Highest sequence number observed from the peer.
    pub fn last_seen(&self) -> Option<u64> {
        match self.last_seen.load(Ordering::Relaxed) {
            NONE_SEEN => None,
            seq => Some(seq),
        }
    }

    /// Forget the peer high-water mark. Called when a new peer connects.
    pub fn reset_peer(&self) {
        self.last_seen.store(NONE_SEEN, Ordering::Relaxed);
    }
}

impl Default for SequenceCorrelator {
    fn default() -> Self {
        Self::new(1)
    }
}
