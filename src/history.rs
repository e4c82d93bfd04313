//! Bounded audit trail of accepted version transitions.
//!
//! Entries are immutable once appended and keyed by version, write-once.
//! Retention is a ring: when the cap is reached the oldest entry is
//! pruned on insert, so the log never grows unbounded.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::delta::ConfigDelta;
use crate::error::{SyncError, SyncResult};
use crate::resolver::ResolutionStrategy;
use crate::snapshot::DeviceId;

/// Kind of change a version transition carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Merge,
}

/// Conflict bookkeeping attached to a merge-born entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The remote version the writer's lineage collided with.
    pub conflicted_with: u64,
    pub strategy: ResolutionStrategy,
    /// Whether a human picked the outcome instead of the resolver.
    pub manual_intervention: bool,
}

/// One accepted version transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub previous_version: u64,
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
    pub change_type: ChangeType,
    /// Dotted paths the transition touched.
    pub changed_paths: Vec<String>,
    pub delta: ConfigDelta,
    pub conflict: Option<ConflictRecord>,
}

/// Append-only, capped history log.
#[derive(Debug)]
pub struct HistoryLog {
    entries: RwLock<VecDeque<HistoryEntry>>,
    retention: usize,
}

impl HistoryLog {
    pub fn new(retention: usize) -> Self {
        // A cap of 0 would make the prune loop spin; keep at least one.
        let retention = retention.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(retention.min(128))),
            retention,
        }
    }

    /// Append an entry. Versions are write-once; re-recording one is a
    /// bug upstream and is rejected. When the cap is reached the oldest
    /// entry is pruned first.
    pub fn append(&self, entry: HistoryEntry) -> SyncResult<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.version == entry.version) {
            return Err(SyncError::InternalError(format!(
                "history already records version {}",
                entry.version
            )));
        }
        while entries.len() >= self.retention {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entry for a specific version, if still retained.
    pub fn get(&self, version: u64) -> Option<HistoryEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.version == version)
            .cloned()
    }

    /// The most recent entry.
    pub fn latest(&self) -> Option<HistoryEntry> {
        self.entries.read().back().cloned()
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Retained entries newer than the given version.
    pub fn entries_after(&self, version: u64) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.version > version)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(version: u64) -> HistoryEntry {
        HistoryEntry {
            version,
            previous_version: version.saturating_sub(1),
            timestamp: Utc::now(),
            device_id: Uuid::from_u128(1),
            change_type: ChangeType::Update,
            changed_paths: vec!["editor.theme".to_string()],
            delta: ConfigDelta::default(),
            conflict: None,
        }
    }

    #[test]
    fn test_append_and_lookup() {
        let log = HistoryLog::new(10);
        log.append(entry(1)).unwrap();
        log.append(entry(2)).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.get(1).unwrap().version, 1);
        assert_eq!(log.latest().unwrap().version, 2);
    }

    #[test]
    fn test_versions_are_write_once() {
        let log = HistoryLog::new(10);
        log.append(entry(5)).unwrap();

        let err = log.append(entry(5)).unwrap_err();
        assert!(err.to_string().contains("already records version 5"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_zero_retention_is_clamped() {
        let log = HistoryLog::new(0);
        log.append(entry(1)).unwrap();
        log.append(entry(2)).unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.latest().unwrap().version, 2);
    }

    #[test]
    fn test_retention_prunes_oldest_on_insert() {
        let log = HistoryLog::new(3);
        for v in 1..=5 {
            log.append(entry(v)).unwrap();
        }

        assert_eq!(log.len(), 3);
        let versions: Vec<u64> = log.entries().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        assert!(log.get(1).is_none());
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_cap_never_exceeded_mid_stream() {
        let log = HistoryLog::new(4);
        for v in 1..=50 {
            log.append(entry(v)).unwrap();
            assert!(log.len() <= 4);
        }
        assert_eq!(log.latest().unwrap().version, 50);
    }

    #[test]
    fn test_entries_after() {
        let log = HistoryLog::new(10);
        for v in 1..=6 {
            log.append(entry(v)).unwrap();
        }

        let tail: Vec<u64> = log.entries_after(4).iter().map(|e| e.version).collect();
        assert_eq!(tail, vec![5, 6]);
        assert!(log.entries_after(6).is_empty());
    }
}
