//! Bounded, ack-watermarked retention of produced log lines.
//!
//! The buffer keeps memory bounded while the network is stalled and lets
//! the transport replay still-unacknowledged entries after a reconnect.
//! Delivery is best-effort: eviction is a size cap, not ack-driven, so
//! entries above the watermark are dropped oldest-first once the cap is
//! exceeded.

use std::collections::VecDeque;

use crate::protocol::LogEntry;

/// Default retained-entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 5000;

/// Bounded insertion-ordered sequence of [`LogEntry`] with an ack watermark.
///
/// Invariants: ids are strictly increasing in insertion order;
/// `last_acked_id` never decreases; `len() <= max_entries` after every
/// operation. Purely in-memory — no operation can fail.
#[derive(Debug)]
pub struct LogBuffer {
    max_entries: usize,
    entries: VecDeque<LogEntry>,
    last_acked_id: u64,
    next_id: u64,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LogBuffer {
    /// Create a buffer retaining at most `max_entries` entries.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
            last_acked_id: 0,
            next_id: 0,
        }
    }

    /// Mint the next entry id (ids start at 1).
    ///
    /// Minting and [`push`](Self::push) must happen under the same lock
    /// hold, so that insertion order always matches id order even with
    /// concurrent producers.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Highest acknowledged entry id (0 before any ack).
    #[must_use]
    pub fn last_acked_id(&self) -> u64 {
        self.last_acked_id
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, evicting from the front once over capacity.
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        self.prune();
    }

    /// Raise the ack watermark.
    ///
    /// Lower or equal ids are ignored, making duplicate and out-of-order
    /// acks harmless. Raising the watermark does not evict beyond the size
    /// cap; it only narrows what [`unacked`](Self::unacked) returns.
    pub fn set_last_acked_id(&mut self, id: u64) {
        if id > self.last_acked_id {
            self.last_acked_id = id;
            self.prune();
        }
    }

    /// Retained entries with `id > last_acked_id`, in id order.
    #[must_use]
    pub fn unacked(&self) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.id > self.last_acked_id)
            .cloned()
            .collect()
    }

    fn prune(&mut self) {
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }
}
