//! Pinnable time source for deterministic tests

use std::sync::atomic::{AtomicU64, Ordering};

use agora_core::{TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Manual Time Source
// ----------------------------------------------------------------------------

/// Time source that only moves when the test says so
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    /// Create a time source pinned at the given millisecond timestamp
    pub fn new(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    /// Pin the clock to an absolute timestamp
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Advance the clock
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.load(Ordering::SeqCst))
    }
}
