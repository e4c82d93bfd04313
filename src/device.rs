//! Device registry.
//!
//! One record per client that has ever synced a user's configuration.
//! Records are created on the first successful sync, updated on every
//! attempt after that, and never deleted: a device that goes silent is
//! only marked inactive once the silence window passes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::snapshot::DeviceId;
use crate::state::SyncDirection;

/// Identity of the device an engine instance runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
    pub app_version: String,
}

impl DeviceIdentity {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            device_id: DeviceId::new_v4(),
            name: name.into(),
            platform: platform.into(),
            app_version: app_version.into(),
        }
    }
}

/// Persistent record of one device's sync relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
    pub app_version: String,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
    /// Last time any sync attempt (successful or not) was seen.
    pub last_seen_at: DateTime<Utc>,
    pub last_sync_version: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_direction: SyncDirection,
    pub uploads: u64,
    pub downloads: u64,
    pub conflicts: u64,
}

impl DeviceRecord {
    fn new(identity: &DeviceIdentity, at: DateTime<Utc>) -> Self {
        Self {
            device_id: identity.device_id,
            name: identity.name.clone(),
            platform: identity.platform.clone(),
            app_version: identity.app_version.clone(),
            is_active: true,
            registered_at: at,
            last_seen_at: at,
            last_sync_version: 0,
            last_sync_at: None,
            last_sync_direction: SyncDirection::None,
            uploads: 0,
            downloads: 0,
            conflicts: 0,
        }
    }
}

/// Registry of all devices that sync a user's configuration.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful sync. Creates the device record on first
    /// contact; afterwards updates version, direction, counters and
    /// re-activates the device if it had been marked stale.
    pub fn record_success(
        &self,
        identity: &DeviceIdentity,
        direction: SyncDirection,
        version: u64,
        at: DateTime<Utc>,
    ) {
        let mut devices = self.devices.write();
        let record = devices
            .entry(identity.device_id)
            .or_insert_with(|| DeviceRecord::new(identity, at));

        record.name = identity.name.clone();
        record.platform = identity.platform.clone();
        record.app_version = identity.app_version.clone();
        record.is_active = true;
        record.last_seen_at = at;
        record.last_sync_version = version;
        record.last_sync_at = Some(at);
        record.last_sync_direction = direction;
        match direction {
            SyncDirection::Upload => record.uploads += 1,
            SyncDirection::Download => record.downloads += 1,
            SyncDirection::None => {}
        }
    }

    /// Record a failed or no-op attempt. Only known devices are touched;
    /// a device earns its record with its first successful sync.
    pub fn record_attempt(&self, device_id: DeviceId, at: DateTime<Utc>) {
        if let Some(record) = self.devices.write().get_mut(&device_id) {
            record.last_seen_at = at;
        }
    }

    /// Bump the conflict counter for a device.
    pub fn record_conflict(&self, device_id: DeviceId) {
        if let Some(record) = self.devices.write().get_mut(&device_id) {
            record.conflicts += 1;
        }
    }

    pub fn get(&self, device_id: DeviceId) -> Option<DeviceRecord> {
        self.devices.read().get(&device_id).cloned()
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.devices.read().contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// All records, sorted by name for stable listings.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Mark devices silent for longer than the window as inactive and
    /// return their ids. Records are kept; nothing is deleted.
    pub fn mark_stale(&self, silence_window: Duration, now: DateTime<Utc>) -> Vec<DeviceId> {
        let silence = chrono::Duration::from_std(silence_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - silence;
        let mut flipped = Vec::new();
        for record in self.devices.write().values_mut() {
            if record.is_active && record.last_seen_at < cutoff {
                record.is_active = false;
                flipped.push(record.device_id);
            }
        }
        flipped
    }
}
