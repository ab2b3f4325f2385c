//! Commit watermarks for out-of-order settlement.
//!
//! Deliveries are settled by concurrent workers in any order, but a Kafka commit of
//! offset `n` marks everything below `n` as consumed. The tracker therefore only
//! advances a partition's commit point past offsets that are all settled.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest settled offset.
    settled_through: Option<i64>,
    committed: Option<i64>,
}

/// Per-partition bookkeeping of in-flight offsets.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received offset. Must be called in receive order.
    pub fn track(&mut self, partition: i32, offset: i64) {
        let state = self.partitions.entry(partition).or_default();
        // Everything below the first offset seen was consumed before us.
        state.committed.get_or_insert(offset);
        state.in_flight.insert(offset);
    }

    /// Mark an offset settled.
    ///
    /// Returns the offset to commit (the next offset to consume) when the
    /// partition's watermark moved, `None` otherwise.
    pub fn settle(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        let next = offset + 1;
        state.settled_through = Some(state.settled_through.map_or(next, |s| s.max(next)));

        let watermark = match state.in_flight.first() {
            Some(&lowest) => lowest,
            None => state.settled_through?,
        };
        if state.committed.is_some_and(|committed| committed >= watermark) {
            return None;
        }
        state.committed = Some(watermark);
        Some(watermark)
    }

    /// Offsets received but not settled, across all partitions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }
}
