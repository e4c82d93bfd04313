//! Offline change queue.
//!
//! While the transport is unreachable, local changes are buffered here
//! instead of failing. The queue is a bounded FIFO: overflow drops the
//! oldest entry with a warning, and replay drains batches in strict
//! enqueue order. Entries live in memory only; changes that survive a
//! restart are picked up by the startup sync instead.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::TriggerKind;

/// One buffered local change awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedChange {
    /// Monotonic sequence number; replay follows it strictly.
    pub sequence: u64,
    /// Trigger that produced the change.
    pub trigger: TriggerKind,
    /// Dotted paths that differed from the synced base when queued.
    pub changed_paths: Vec<String>,
    pub queued_at: DateTime<Utc>,
}

/// Bounded FIFO of changes made while offline.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedChange>,
    capacity: usize,
    next_sequence: u64,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_sequence: 1,
            dropped: 0,
        }
    }

    /// Buffer a change, dropping the oldest entry when full. Returns the
    /// sequence number assigned to the new entry.
    pub fn enqueue(&mut self, trigger: TriggerKind, changed_paths: Vec<String>) -> u64 {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                self.dropped += 1;
                warn!(
                    sequence = oldest.sequence,
                    capacity = self.capacity,
                    "offline queue full, dropping oldest entry"
                );
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(QueuedChange {
            sequence,
            trigger,
            changed_paths,
            queued_at: Utc::now(),
        });
        debug!(sequence, pending = self.entries.len(), "change queued offline");
        sequence
    }

    /// Remove and return up to `max` entries in enqueue order.
    pub fn drain_batch(&mut self, max: usize) -> Vec<QueuedChange> {
        let take = max.min(self.entries.len());
        self.entries.drain(..take).collect()
    }

    /// Oldest entry without removing it.
    pub fn peek(&self) -> Option<&QueuedChange> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries discarded by overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
