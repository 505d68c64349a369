//! Open-time tunables for a [`crate::store::Store`]. Loading these from a
//! config file or environment is the embedding application's job; this
//! module only owns the typed defaults the core itself needs.

/// Default cap on a segment's size in bytes before it rolls over.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

/// Default cap on a segment's entry count before it rolls over.
pub const DEFAULT_MAX_SEGMENT_ENTRIES: u64 = 1_000_000;

/// Default interval, in seconds, between periodic metadata sidecar syncs.
pub const DEFAULT_METADATA_SYNC_INTERVAL_SECONDS: f64 = 5.0;

/// Open-time configuration for a [`crate::store::Store`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Maximum size, in bytes, a segment may reach before it is rolled over.
    pub max_segment_size: u64,
    /// Maximum number of entries a segment may hold before it is rolled over.
    pub max_segment_entries: u64,
    /// Minimum interval, in seconds, between periodic metadata sidecar syncs.
    pub metadata_sync_interval: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segment_entries: DEFAULT_MAX_SEGMENT_ENTRIES,
            metadata_sync_interval: DEFAULT_METADATA_SYNC_INTERVAL_SECONDS,
        }
    }
}
