//! Wire protocol between a device and the configuration store.
//!
//! Request/response pairs for the status check, upload and download
//! operations, one-way conflict messages, and the push event the store
//! broadcasts after every accepted write. Messages are explicit structs
//! validated at construction; the wire encoding is length-prefixed
//! bincode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::ConfigDelta;
use crate::error::{SyncError, SyncResult};
use crate::history::{ChangeType, ConflictRecord};
use crate::resolver::ResolutionStrategy;
use crate::snapshot::{ConfigSnapshot, DeviceId};

fn validate_user_id(user_id: &str) -> SyncResult<()> {
    if user_id.is_empty() {
        return Err(SyncError::InvalidPayload(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Ask the store for the current head without transferring the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatusRequest {
    pub user_id: String,
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
}

impl CheckStatusRequest {
    pub fn new(user_id: impl Into<String>, device_id: DeviceId) -> SyncResult<Self> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;
        Ok(Self {
            user_id,
            device_id,
            timestamp: Utc::now(),
        })
    }
}

/// Head summary: version, hash and authorship, but no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatusResponse {
    pub user_id: String,
    /// 0 when no snapshot has ever been written.
    pub current_version: u64,
    pub content_hash: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_modified_by: Option<DeviceId>,
    pub timestamp: DateTime<Utc>,
}

impl CheckStatusResponse {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            current_version: 0,
            content_hash: None,
            last_modified: None,
            last_modified_by: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_head(user_id: impl Into<String>, head: &ConfigSnapshot) -> Self {
        Self {
            user_id: user_id.into(),
            current_version: head.version,
            content_hash: Some(head.content_hash.clone()),
            last_modified: Some(head.last_modified),
            last_modified_by: Some(head.last_modified_by),
            timestamp: Utc::now(),
        }
    }
}

/// Propose a new head. The snapshot's `previous_version` lets the store
/// enforce the increment-by-exactly-one rule atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfigRequest {
    pub user_id: String,
    pub device_id: DeviceId,
    pub snapshot: ConfigSnapshot,
    pub change_type: ChangeType,
    pub changed_paths: Vec<String>,
    pub delta: ConfigDelta,
    /// Present when the write came out of conflict resolution.
    pub conflict: Option<ConflictRecord>,
    pub timestamp: DateTime<Utc>,
}

impl UploadConfigRequest {
    pub fn new(
        user_id: impl Into<String>,
        device_id: DeviceId,
        snapshot: ConfigSnapshot,
        change_type: ChangeType,
        delta: ConfigDelta,
        conflict: Option<ConflictRecord>,
    ) -> SyncResult<Self> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;
        Ok(Self {
            user_id,
            device_id,
            changed_paths: delta.changed_paths(),
            snapshot,
            change_type,
            delta,
            conflict,
            timestamp: Utc::now(),
        })
    }
}

/// Why an upload was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadRejection {
    /// `previous_version` no longer names the head.
    Stale { store_version: u64 },
    PayloadTooLarge { size: usize, limit: usize },
    InvalidPayload { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfigResponse {
    pub user_id: String,
    pub accepted: bool,
    /// The store's version after handling the request: the new head on
    /// acceptance, the unchanged head on rejection.
    pub version: u64,
    pub rejection: Option<UploadRejection>,
    pub timestamp: DateTime<Utc>,
}

impl UploadConfigResponse {
    pub fn accepted(user_id: impl Into<String>, version: u64) -> Self {
        Self {
            user_id: user_id.into(),
            accepted: true,
            version,
            rejection: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(user_id: impl Into<String>, version: u64, rejection: UploadRejection) -> Self {
        Self {
            user_id: user_id.into(),
            accepted: false,
            version,
            rejection: Some(rejection),
            timestamp: Utc::now(),
        }
    }

    /// Map a rejection onto the error the workflow handles.
    pub fn to_error(&self, attempted_previous: u64) -> Option<SyncError> {
        match &self.rejection {
            None => None,
            Some(UploadRejection::Stale { store_version }) => Some(SyncError::StaleWrite {
                expected: attempted_previous,
                actual: *store_version,
            }),
            Some(UploadRejection::PayloadTooLarge { size, limit }) => {
                Some(SyncError::PayloadTooLarge {
                    size: *size,
                    limit: *limit,
                })
            }
            Some(UploadRejection::InvalidPayload { reason }) => {
                Some(SyncError::InvalidPayload(reason.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfigRequest {
    pub user_id: String,
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
}

impl DownloadConfigRequest {
    pub fn new(user_id: impl Into<String>, device_id: DeviceId) -> SyncResult<Self> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;
        Ok(Self {
            user_id,
            device_id,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfigResponse {
    pub user_id: String,
    /// Absent when the store holds no snapshot yet.
    pub snapshot: Option<ConfigSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// One-way: a device reporting it detected a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictNotification {
    pub user_id: String,
    pub device_id: DeviceId,
    pub local_version: u64,
    pub remote_version: u64,
    pub conflict_paths: Vec<String>,
    pub strategy: ResolutionStrategy,
    pub needs_manual: bool,
    pub timestamp: DateTime<Utc>,
}

/// How a human settled a conflict the resolver escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    KeepLocal,
    KeepRemote,
    Merged,
}

/// One-way: a device reporting the outcome of manual resolution. The
/// resulting content travels separately through a normal upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub user_id: String,
    pub device_id: DeviceId,
    pub conflicted_version: u64,
    pub choice: ManualChoice,
    pub timestamp: DateTime<Utc>,
}

/// Push event the store broadcasts to every other device after an
/// accepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub user_id: String,
    pub version: u64,
    pub change_type: ChangeType,
    pub changed_paths: Vec<String>,
    /// Device whose write produced the version.
    pub origin_device: DeviceId,
    pub timestamp: DateTime<Utc>,
}

/// Messages exchanged between a device and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    CheckStatus(CheckStatusRequest),
    CheckStatusReply(CheckStatusResponse),
    UploadConfig(Box<UploadConfigRequest>),
    UploadConfigReply(UploadConfigResponse),
    DownloadConfig(DownloadConfigRequest),
    DownloadConfigReply(Box<DownloadConfigResponse>),
    Conflict(ConflictNotification),
    ResolveConflict(ResolveConflictRequest),
    Event(SyncEvent),
}

impl WireMessage {
    /// Encode to bincode bytes with a u32 big-endian length prefix.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| SyncError::InternalError(format!("message encoding failed: {}", e)))?;
        let len = payload.len() as u32;
        let mut result = Vec::with_capacity(4 + payload.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend(payload);
        Ok(result)
    }

    /// Decode from bincode bytes (without the length prefix).
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| SyncError::InvalidPayload(format!("message decoding failed: {}", e)))
    }
}
