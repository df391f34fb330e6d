//! Reorder window for incoming frame sets
//!
//! Frame sets reach the proxy out of order and at a variable rate. The
//! buffer holds a fixed number of them and releases the oldest one only once
//! the window is full, so that the backend always sees non-decreasing
//! timestamps as long as an entry is not more than `depth` insertions late.

use log::warn;
use std::collections::VecDeque;

use crate::assets::DEFAULT_REORDER_DEPTH;
use crate::pipeline::types::{OrderedQueueEntry, Timestamp};

/// Reorder window configuration
#[derive(Debug, Clone, Copy)]
pub struct ReorderConfig {
    /// Minimum buffered entry count before the oldest is released
    pub depth: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_REORDER_DEPTH,
        }
    }
}

/// Bounded reordering buffer of decoded frame sets
///
/// Entries are kept sorted by timestamp at all times; equal timestamps keep
/// their arrival order. Not synchronized by itself: the owning session wraps
/// it in its own mutex.
pub struct FrameBuffer {
    /// Entries ascending by timestamp
    entries: VecDeque<OrderedQueueEntry>,
    /// Timestamp of the last entry handed to the backend
    last_emitted: Timestamp,
    config: ReorderConfig,
    /// Statistics
    inserted: u64,
    reordered: u64,
    extracted: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with the given configuration
    pub fn new(config: ReorderConfig) -> Self {
        let depth = config.depth.max(1);
        Self {
            entries: VecDeque::with_capacity(depth + 1),
            last_emitted: Timestamp::default(),
            config: ReorderConfig { depth },
            inserted: 0,
            reordered: 0,
            extracted: 0,
        }
    }

    /// Insert an entry into the window, keeping timestamp order
    pub fn insert(&mut self, entry: OrderedQueueEntry) {
        self.inserted += 1;

        // first entry strictly newer than the incoming one
        let pos = self
            .entries
            .iter()
            .position(|e| e.timestamp > entry.timestamp);

        match pos {
            Some(i) => {
                self.entries.insert(i, entry);
                self.reordered += 1;
            }
            None => self.entries.push_back(entry),
        }
    }

    /// True once the window holds at least `depth` entries
    pub fn is_ready_to_extract(&self) -> bool {
        !self.entries.is_empty() && self.entries.len() >= self.config.depth
    }

    /// Remove and return the entry with the smallest timestamp
    ///
    /// Returns `None` when the window is not full yet.
    pub fn extract_oldest(&mut self) -> Option<OrderedQueueEntry> {
        if !self.is_ready_to_extract() {
            return None;
        }

        let entry = self.entries.pop_front()?;
        if entry.timestamp < self.last_emitted {
            // only reachable when an entry slipped in after its slot was released
            warn!(
                "FrameBuffer: emitting {} after {}, order not preserved",
                entry.timestamp, self.last_emitted
            );
        }
        self.last_emitted = entry.timestamp;
        self.extracted += 1;
        Some(entry)
    }

    /// Whether a timestamp is older than the last released entry
    pub fn is_stale(&self, timestamp: Timestamp) -> bool {
        timestamp < self.last_emitted
    }

    /// Timestamp of the last released entry (0 before the first release)
    pub fn last_emitted(&self) -> Timestamp {
        self.last_emitted
    }

    /// Drop all buffered entries, keeping the last released timestamp
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Drop all buffered entries and forget the last released timestamp
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last_emitted = Timestamp::default();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.config.depth
    }

    /// Get statistics: (inserted, reordered, extracted, buffered)
    pub fn stats(&self) -> (u64, u64, u64, usize) {
        (self.inserted, self.reordered, self.extracted, self.entries.len())
    }
}
