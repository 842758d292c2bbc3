//! Logical clock for stamping local writes.

use crate::error::{SyncError, SyncResult};
use std::sync::atomic::{AtomicU64, Ordering};
use zonesync_protocol::LogicalTimestamp;

/// Hands out timestamps greater than every timestamp observed so far.
#[derive(Debug, Default)]
pub struct LogicalClock {
    high_water: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock starting at `start`.
    pub fn new(start: LogicalTimestamp) -> Self {
        Self {
            high_water: AtomicU64::new(start.as_u64()),
        }
    }

    /// Raises the high-water mark to at least `ts`.
    pub fn observe(&self, ts: LogicalTimestamp) {
        self.high_water.fetch_max(ts.as_u64(), Ordering::SeqCst);
    }

    /// Returns a fresh timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClockExhausted`] once `u64::MAX` has been
    /// observed or issued. The clock never wraps.
    pub fn tick(&self) -> SyncResult<LogicalTimestamp> {
        self.high_water
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ts| ts.checked_add(1))
            .map(|prev| LogicalTimestamp::new(prev + 1))
            .map_err(|_| SyncError::ClockExhausted)
    }

    /// Returns a fresh timestamp greater than `floor` as well.
    pub fn tick_after(&self, floor: LogicalTimestamp) -> SyncResult<LogicalTimestamp> {
        self.observe(floor);
        self.tick()
    }

    /// Returns true if a clock that observed `ts` can still issue a later one.
    pub fn leaves_room(ts: LogicalTimestamp) -> bool {
        ts.as_u64() < u64::MAX
    }

    /// The largest timestamp observed or issued.
    pub fn current(&self) -> LogicalTimestamp {
        LogicalTimestamp::new(self.high_water.load(Ordering::SeqCst))
    }
}
