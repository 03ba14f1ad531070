//! Configuration for sessions and the snapshot subsystem

use core::time::Duration;

// ----------------------------------------------------------------------------
// Snapshot Configuration
// ----------------------------------------------------------------------------

/// Configuration for the snapshot manager
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Fixed interval of the per-session publish loop
    pub publish_interval: Duration,
    /// Announcements older than this are rejected on import
    pub staleness_window: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(60 * 60), // hourly
            staleness_window: Duration::from_secs(18 * 60 * 60), // 18 hours
        }
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for session binding and event delivery
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Buffer size of the per-session domain-event broadcast channel
    pub event_buffer_size: usize,
    /// Fall back to a network-wide historical query when local replay
    /// yields no questions
    pub network_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 64, // UI consumers drain quickly
            network_fallback: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Combined Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration handed to the session registry
#[derive(Debug, Clone, Default)]
pub struct AgoraConfig {
    pub session: SessionConfig,
    pub snapshot: SnapshotConfig,
}
