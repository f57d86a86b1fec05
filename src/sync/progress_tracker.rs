//! Progress tracking for event synchronization.
//!
//! This module provides the `SyncProgressTracker`, which is responsible for tracking the progress
//! of the poll loop. It counts applied and ignored events and completed block ranges, logs at a
//! fixed block interval and reports a summary once the synchronizer reaches the ledger head.

use crate::ledger::EventPosition;

use tracing::info;

/// Service for tracking synchronization progress
///
/// The progress tracker records the last applied event and the highest completed block, and
/// counts events per outcome so operators can see whether the scope is actually receiving data.
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    /// First block this session started fetching from
    start_block: u64,
    /// Highest block whose range has been fully applied
    highest_complete_block: Option<u64>,
    /// Position of the last applied event
    last_position: Option<EventPosition>,
    /// Events that mutated this scope
    events_applied: usize,
    /// Events for other scopes
    events_ignored: usize,
    /// Block ranges fetched and completed
    ranges_completed: usize,
    /// Last block at which we logged progress
    last_logged_block: u64,
    /// Blocks between progress lines
    log_interval: u64,
}

impl SyncProgressTracker {
    /// Create a new progress tracker starting from the given block.
    pub fn new(start_block: u64, log_interval: u64) -> Self {
        Self {
            start_block,
            highest_complete_block: None,
            last_position: None,
            events_applied: 0,
            events_ignored: 0,
            ranges_completed: 0,
            last_logged_block: start_block,
            log_interval: log_interval.max(1),
        }
    }

    /// Record one committed event
    pub fn record_event(&mut self, position: EventPosition, applied: bool) {
        self.last_position = Some(position);
        if applied {
            self.events_applied += 1;
        } else {
            self.events_ignored += 1;
        }
    }

    /// Record a fully applied block range ending at `to_block`
    pub fn record_range(&mut self, to_block: u64) {
        self.highest_complete_block = Some(self.highest_complete_block.map_or(to_block, |b| b.max(to_block)));
        self.ranges_completed += 1;
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&mut self, force: bool) {
        let Some(block) = self.highest_complete_block else {
            return;
        };
        let blocks_since_last_log = block.saturating_sub(self.last_logged_block);
        if force || blocks_since_last_log >= self.log_interval {
            info!(
                "Sync progress: {} events applied, {} ignored, complete up to block {}",
                self.events_applied, self.events_ignored, block
            );
            self.last_logged_block = block;
        }
    }

    /// Get sync statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            start_block: self.start_block,
            highest_complete_block: self.highest_complete_block,
            last_position: self.last_position,
            events_applied: self.events_applied,
            events_ignored: self.events_ignored,
            ranges_completed: self.ranges_completed,
        }
    }
}

/// Statistics about the sync progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub start_block: u64,
    pub highest_complete_block: Option<u64>,
    pub last_position: Option<EventPosition>,
    pub events_applied: usize,
    pub events_ignored: usize,
    pub ranges_completed: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "Sync from block {} to {}: {} events applied, {} ignored, {} ranges{}",
            self.start_block,
            self.highest_complete_block
                .map_or_else(|| "-".to_string(), |b| b.to_string()),
            self.events_applied,
            self.events_ignored,
            self.ranges_completed,
            match self.last_position {
                Some(position) => format!(" (last event {})", position),
                None => String::new(),
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_events_and_ranges() {
        let mut tracker = SyncProgressTracker::new(10, 100);
        let position = EventPosition {
            block_number: 12,
            transaction_index: 1,
            log_index: 0,
        };
        tracker.record_event(position, true);
        tracker.record_event(position, false);
        tracker.record_range(20);
        tracker.record_range(15);

        let stats = tracker.get_stats();
        assert_eq!(stats.events_applied, 1);
        assert_eq!(stats.events_ignored, 1);
        assert_eq!(stats.highest_complete_block, Some(20));
        assert_eq!(stats.ranges_completed, 2);
        assert_eq!(
            stats.summary(),
            "Sync from block 10 to 20: 1 events applied, 1 ignored, 2 ranges (last event 12:1:0)"
        );
    }

    #[test]
    fn summary_before_any_range() {
        let stats = SyncProgressTracker::new(0, 0).get_stats();
        assert_eq!(stats.summary(), "Sync from block 0 to -: 0 events applied, 0 ignored, 0 ranges");
    }
}
