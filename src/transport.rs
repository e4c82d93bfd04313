//! Transport to the configuration store.
//!
//! `SyncTransport` is the seam the engine talks through; everything the
//! store does is behind it. `InMemoryStore` is the reference store: it
//! owns the head snapshot per user, enforces the increment-by-one write
//! rule atomically, keeps the device and history sub-collections, and
//! broadcasts a push event after every accepted write. `InMemoryTransport`
//! is one device's handle onto a shared store, with connectivity and
//! latency controls for exercising offline and timeout behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::MAX_PAYLOAD_BYTES;
use crate::error::{SyncError, SyncResult};
use crate::history::{HistoryEntry, HistoryLog};
use crate::protocol::{
    CheckStatusRequest, CheckStatusResponse, ConflictNotification, DownloadConfigRequest,
    DownloadConfigResponse, ResolveConflictRequest, SyncEvent, UploadConfigRequest,
    UploadConfigResponse, UploadRejection, WireMessage,
};
use crate::snapshot::{ConfigSnapshot, DeviceId};
use crate::state::SyncDirection;

/// Capacity of the push event channel; slow subscribers lag rather than
/// block writers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Device-to-store operations the engine is written against.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetch the head summary without transferring the payload.
    async fn check_status(&self, request: CheckStatusRequest) -> SyncResult<CheckStatusResponse>;

    /// Propose a new head snapshot.
    async fn upload(&self, request: UploadConfigRequest) -> SyncResult<UploadConfigResponse>;

    /// Fetch the full head snapshot.
    async fn download(&self, request: DownloadConfigRequest) -> SyncResult<DownloadConfigResponse>;

    /// Report a detected conflict.
    async fn notify_conflict(&self, notification: ConflictNotification) -> SyncResult<()>;

    /// Report how a human settled an escalated conflict.
    async fn resolve_conflict(&self, request: ResolveConflictRequest) -> SyncResult<()>;

    /// Push events for every accepted write, including this device's own.
    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent>;

    /// Whether the store is currently reachable.
    fn is_connected(&self) -> bool;
}

/// The store's view of one device, built from the requests it has seen.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDeviceRecord {
    pub device_id: DeviceId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_sync_version: u64,
    pub last_sync_direction: SyncDirection,
    pub uploads: u64,
    pub downloads: u64,
    pub conflicts: u64,
}

impl RemoteDeviceRecord {
    fn new(device_id: DeviceId, at: DateTime<Utc>) -> Self {
        Self {
            device_id,
            first_seen: at,
            last_seen: at,
            last_sync_version: 0,
            last_sync_direction: SyncDirection::None,
            uploads: 0,
            downloads: 0,
            conflicts: 0,
        }
    }
}

/// Per-user record: head snapshot plus device and history sub-collections.
struct UserState {
    head: Option<ConfigSnapshot>,
    history: HistoryLog,
    devices: HashMap<DeviceId, RemoteDeviceRecord>,
    conflicts: Vec<ConflictNotification>,
    resolutions: Vec<ResolveConflictRequest>,
}

impl UserState {
    fn new(retention: usize) -> Self {
        Self {
            head: None,
            history: HistoryLog::new(retention),
            devices: HashMap::new(),
            conflicts: Vec::new(),
            resolutions: Vec::new(),
        }
    }

    fn touch_device(&mut self, device_id: DeviceId, at: DateTime<Utc>) {
        self.devices
            .entry(device_id)
            .or_insert_with(|| RemoteDeviceRecord::new(device_id, at))
            .last_seen = at;
    }
}

/// In-process reference store shared by every device under test.
pub struct InMemoryStore {
    users: RwLock<HashMap<String, UserState>>,
    history_retention: usize,
    max_payload_bytes: usize,
    events: broadcast::Sender<SyncEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            users: RwLock::new(HashMap::new()),
            history_retention: 100,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            events,
        }
    }

    pub fn with_history_retention(mut self, retention: usize) -> Self {
        self.history_retention = retention;
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn handle_check(&self, request: &CheckStatusRequest) -> CheckStatusResponse {
        let mut users = self.users.write();
        let user = users
            .entry(request.user_id.clone())
            .or_insert_with(|| UserState::new(self.history_retention));
        user.touch_device(request.device_id, request.timestamp);
        match &user.head {
            Some(head) => CheckStatusResponse::for_head(&request.user_id, head),
            None => CheckStatusResponse::empty(&request.user_id),
        }
    }

    /// The store-side write rule: a snapshot is accepted only when its
    /// `previous_version` names the current head and its version is
    /// exactly one above it. Checked and applied under one lock, so two
    /// racing writers cannot both win.
    pub fn handle_upload(&self, request: &UploadConfigRequest) -> UploadConfigResponse {
        let event = {
            let mut users = self.users.write();
            let user = users
                .entry(request.user_id.clone())
                .or_insert_with(|| UserState::new(self.history_retention));
            user.touch_device(request.device_id, request.timestamp);

            let store_version = user.head.as_ref().map(|h| h.version).unwrap_or(0);
            let snapshot = &request.snapshot;

            if snapshot.previous_version != store_version
                || snapshot.version != store_version + 1
            {
                debug!(
                    user = %request.user_id,
                    device = %request.device_id,
                    attempted = snapshot.version,
                    head = store_version,
                    "rejecting stale write"
                );
                return UploadConfigResponse::rejected(
                    &request.user_id,
                    store_version,
                    UploadRejection::Stale { store_version },
                );
            }

            if snapshot.metadata.canonical_size > self.max_payload_bytes {
                return UploadConfigResponse::rejected(
                    &request.user_id,
                    store_version,
                    UploadRejection::PayloadTooLarge {
                        size: snapshot.metadata.canonical_size,
                        limit: self.max_payload_bytes,
                    },
                );
            }

            let entry = HistoryEntry {
                version: snapshot.version,
                previous_version: snapshot.previous_version,
                timestamp: request.timestamp,
                device_id: request.device_id,
                change_type: request.change_type,
                changed_paths: request.changed_paths.clone(),
                delta: request.delta.clone(),
                conflict: request.conflict.clone(),
            };
            if let Err(err) = user.history.append(entry) {
                warn!(version = snapshot.version, error = %err, "history append failed");
            }

            let record = user
                .devices
                .entry(request.device_id)
                .or_insert_with(|| RemoteDeviceRecord::new(request.device_id, request.timestamp));
            record.uploads += 1;
            record.last_sync_version = snapshot.version;
            record.last_sync_direction = SyncDirection::Upload;

            user.head = Some(snapshot.clone());
            info!(
                user = %request.user_id,
                device = %request.device_id,
                version = snapshot.version,
                "accepted new head"
            );

            SyncEvent {
                user_id: request.user_id.clone(),
                version: snapshot.version,
                change_type: request.change_type,
                changed_paths: request.changed_paths.clone(),
                origin_device: request.device_id,
                timestamp: Utc::now(),
            }
        };

        let version = event.version;
        // A send error only means nobody is subscribed.
        let _ = self.events.send(event);
        UploadConfigResponse::accepted(&request.user_id, version)
    }

    pub fn handle_download(&self, request: &DownloadConfigRequest) -> DownloadConfigResponse {
        let mut users = self.users.write();
        let user = users
            .entry(request.user_id.clone())
            .or_insert_with(|| UserState::new(self.history_retention));
        user.touch_device(request.device_id, request.timestamp);

        if let Some(head_version) = user.head.as_ref().map(|h| h.version) {
            let record = user
                .devices
                .entry(request.device_id)
                .or_insert_with(|| RemoteDeviceRecord::new(request.device_id, request.timestamp));
            record.downloads += 1;
            record.last_sync_version = head_version;
            record.last_sync_direction = SyncDirection::Download;
        }

        DownloadConfigResponse {
            user_id: request.user_id.clone(),
            snapshot: user.head.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn record_conflict(&self, notification: ConflictNotification) {
        let mut users = self.users.write();
        let user = users
            .entry(notification.user_id.clone())
            .or_insert_with(|| UserState::new(self.history_retention));
        user.touch_device(notification.device_id, notification.timestamp);
        if let Some(record) = user.devices.get_mut(&notification.device_id) {
            record.conflicts += 1;
        }
        user.conflicts.push(notification);
    }

    pub fn record_resolution(&self, request: ResolveConflictRequest) {
        let mut users = self.users.write();
        let user = users
            .entry(request.user_id.clone())
            .or_insert_with(|| UserState::new(self.history_retention));
        user.touch_device(request.device_id, request.timestamp);
        user.resolutions.push(request);
    }

    /// Current head version; 0 when nothing was ever written.
    pub fn version(&self, user_id: &str) -> u64 {
        self.users
            .read()
            .get(user_id)
            .and_then(|u| u.head.as_ref())
            .map(|h| h.version)
            .unwrap_or(0)
    }

    pub fn head(&self, user_id: &str) -> Option<ConfigSnapshot> {
        self.users
            .read()
            .get(user_id)
            .and_then(|u| u.head.clone())
    }

    pub fn history(&self, user_id: &str) -> Vec<HistoryEntry> {
        self.users
            .read()
            .get(user_id)
            .map(|u| u.history.entries())
            .unwrap_or_default()
    }

    pub fn device(&self, user_id: &str, device_id: DeviceId) -> Option<RemoteDeviceRecord> {
        self.users
            .read()
            .get(user_id)
            .and_then(|u| u.devices.get(&device_id).cloned())
    }

    pub fn devices(&self, user_id: &str) -> Vec<RemoteDeviceRecord> {
        self.users
            .read()
            .get(user_id)
            .map(|u| u.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn conflict_notifications(&self, user_id: &str) -> Vec<ConflictNotification> {
        self.users
            .read()
            .get(user_id)
            .map(|u| u.conflicts.clone())
            .unwrap_or_default()
    }

    pub fn resolutions(&self, user_id: &str) -> Vec<ResolveConflictRequest> {
        self.users
            .read()
            .get(user_id)
            .map(|u| u.resolutions.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One device's handle onto a shared [`InMemoryStore`].
///
/// Every request and response passes through the wire codec, so the
/// in-process path exercises the same framing a remote store would see.
pub struct InMemoryTransport {
    store: Arc<InMemoryStore>,
    connected: AtomicBool,
    latency: RwLock<Duration>,
    fail_next: AtomicU32,
}

impl InMemoryTransport {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            connected: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delay added to every request, for timeout tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Fail the next `count` requests with a connection error even while
    /// nominally connected, for retry tests.
    pub fn fail_next_requests(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    async fn simulate(&self) -> SyncResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed(
                "transport is offline".to_string(),
            ));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::ConnectionFailed(
                "injected transient failure".to_string(),
            ));
        }
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    /// Encode then decode, as a frame crossing a socket would.
    fn over_wire(message: WireMessage) -> SyncResult<WireMessage> {
        let encoded = message.encode()?;
        WireMessage::decode(&encoded[4..])
    }
}

#[async_trait]
impl SyncTransport for InMemoryTransport {
    async fn check_status(&self, request: CheckStatusRequest) -> SyncResult<CheckStatusResponse> {
        self.simulate().await?;
        let request = match Self::over_wire(WireMessage::CheckStatus(request))? {
            WireMessage::CheckStatus(req) => req,
            other => {
                return Err(SyncError::InternalError(format!(
                    "unexpected frame {:?}",
                    other
                )))
            }
        };
        let response = self.store.handle_check(&request);
        match Self::over_wire(WireMessage::CheckStatusReply(response))? {
            WireMessage::CheckStatusReply(resp) => Ok(resp),
            other => Err(SyncError::InternalError(format!(
                "unexpected frame {:?}",
                other
            ))),
        }
    }

    async fn upload(&self, request: UploadConfigRequest) -> SyncResult<UploadConfigResponse> {
        self.simulate().await?;
        let request = match Self::over_wire(WireMessage::UploadConfig(Box::new(request)))? {
            WireMessage::UploadConfig(req) => *req,
            other => {
                return Err(SyncError::InternalError(format!(
                    "unexpected frame {:?}",
                    other
                )))
            }
        };
        let response = self.store.handle_upload(&request);
        match Self::over_wire(WireMessage::UploadConfigReply(response))? {
            WireMessage::UploadConfigReply(resp) => Ok(resp),
            other => Err(SyncError::InternalError(format!(
                "unexpected frame {:?}",
                other
            ))),
        }
    }

    async fn download(&self, request: DownloadConfigRequest) -> SyncResult<DownloadConfigResponse> {
        self.simulate().await?;
        let request = match Self::over_wire(WireMessage::DownloadConfig(request))? {
            WireMessage::DownloadConfig(req) => req,
            other => {
                return Err(SyncError::InternalError(format!(
                    "unexpected frame {:?}",
                    other
                )))
            }
        };
        let response = self.store.handle_download(&request);
        match Self::over_wire(WireMessage::DownloadConfigReply(Box::new(response)))? {
            WireMessage::DownloadConfigReply(resp) => Ok(*resp),
            other => Err(SyncError::InternalError(format!(
                "unexpected frame {:?}",
                other
            ))),
        }
    }

    async fn notify_conflict(&self, notification: ConflictNotification) -> SyncResult<()> {
        self.simulate().await?;
        let notification = match Self::over_wire(WireMessage::Conflict(notification))? {
            WireMessage::Conflict(note) => note,
            other => {
                return Err(SyncError::InternalError(format!(
                    "unexpected frame {:?}",
                    other
                )))
            }
        };
        self.store.record_conflict(notification);
        Ok(())
    }

    async fn resolve_conflict(&self, request: ResolveConflictRequest) -> SyncResult<()> {
        self.simulate().await?;
        let request = match Self::over_wire(WireMessage::ResolveConflict(request))? {
            WireMessage::ResolveConflict(req) => req,
            other => {
                return Err(SyncError::InternalError(format!(
                    "unexpected frame {:?}",
                    other
                )))
            }
        };
        self.store.record_resolution(request);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.store.subscribe_events()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
