//! Engine configuration.
//!
//! All tunables live here: per-operation network timeouts, the overall
//! session deadline, trigger debounce/interval windows, queue and history
//! caps, payload limits and the retry policy. Defaults are safe for
//! production; tests shrink the durations.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::resolver::ResolutionStrategy;

/// Hard cap on the canonical (unencrypted) payload size.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Configuration for a sync engine instance.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// User the configuration belongs to.
    pub user_id: String,
    /// Timeout for the status check round-trip.
    pub check_timeout: Duration,
    /// Timeout for uploading a snapshot.
    pub upload_timeout: Duration,
    /// Timeout for downloading a snapshot.
    pub download_timeout: Duration,
    /// Timeout for conflict notification round-trips.
    pub resolve_timeout: Duration,
    /// Overall deadline for one sync session, checked between steps.
    pub session_deadline: Duration,
    /// Quiet window after a file change before a sync is triggered.
    pub debounce_window: Duration,
    /// Interval for the periodic trigger (fires only when dirty).
    pub periodic_interval: Duration,
    /// Silence window after which a device is marked inactive.
    pub device_silence_window: Duration,
    /// Offline queue capacity; overflow drops the oldest entry.
    pub queue_capacity: usize,
    /// Maximum queued changes replayed per drained batch.
    pub queue_batch_size: usize,
    /// History entries retained per user; older entries are pruned.
    pub history_retention: usize,
    /// Hard cap on the canonical payload size in bytes.
    pub max_payload_bytes: usize,
    /// Canonical payloads at or above this size are LZ4-compressed
    /// before encryption.
    pub compression_threshold: usize,
    /// Strategy applied when a conflict is detected.
    pub strategy: ResolutionStrategy,
    /// Retry policy for retryable errors.
    pub backoff: BackoffPolicy,
    /// Whether the engine reacts to store push events. Disabled, the
    /// engine only syncs on explicit, periodic and file-watch triggers.
    pub live_events: bool,
}

impl SyncSettings {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            check_timeout: Duration::from_secs(10),
            upload_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(10),
            session_deadline: Duration::from_secs(120),
            debounce_window: Duration::from_secs(5),
            periodic_interval: Duration::from_secs(300),
            device_silence_window: Duration::from_secs(30 * 24 * 3600),
            queue_capacity: 100,
            queue_batch_size: 10,
            history_retention: 100,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            compression_threshold: 4096,
            strategy: ResolutionStrategy::Auto,
            backoff: BackoffPolicy::default(),
            live_events: true,
        }
    }

    /// Sets the strategy applied to detected conflicts.
    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets all four per-operation network timeouts at once.
    pub fn with_network_timeouts(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self.upload_timeout = timeout;
        self.download_timeout = timeout;
        self.resolve_timeout = timeout;
        self
    }

    /// Sets the overall session deadline.
    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    /// Sets the file-watch debounce window.
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Sets the periodic trigger interval.
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Sets the offline queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the history retention cap.
    pub fn with_history_retention(mut self, retention: usize) -> Self {
        self.history_retention = retention;
        self
    }

    /// Enables or disables reactions to store push events.
    pub fn with_live_events(mut self, live: bool) -> Self {
        self.live_events = live;
        self
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new("")
    }
}
