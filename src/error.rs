use thiserror::Error;

/// Coarse classification used for retry policy and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Network,
    Auth,
    Version,
    Data,
    Conflict,
    Storage,
    General,
}

#[derive(Error, Debug)]
pub enum SyncError {
    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation '{operation}' timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    // Authentication errors
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    // Version errors
    #[error("Stale write rejected: expected previous version {expected}, store is at {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    #[error("Lineage mismatch: local version {local} does not descend from remote {remote}")]
    LineageMismatch { local: u64, remote: u64 },

    // Data errors
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Payload sealing failed: {0}")]
    SealFailure(String),

    #[error("Payload opening failed: {0}")]
    OpenFailure(String),

    #[error("Content hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // Conflict errors
    #[error("Conflict requires manual resolution on paths: {0}")]
    ManualResolutionRequired(String),

    #[error("Unresolved conflict: {0}")]
    UnresolvedConflict(String),

    // Storage errors
    #[error("Storage failure: {0}")]
    StorageFailed(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    // General errors
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Device '{0}' is not registered")]
    DeviceUnregistered(String),

    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// The error's class, stable across message wording changes.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::ConnectionFailed(_) | SyncError::Timeout { .. } => ErrorClass::Network,
            SyncError::AuthFailed(_) => ErrorClass::Auth,
            SyncError::StaleWrite { .. } | SyncError::LineageMismatch { .. } => ErrorClass::Version,
            SyncError::InvalidPayload(_)
            | SyncError::SealFailure(_)
            | SyncError::OpenFailure(_)
            | SyncError::HashMismatch { .. }
            | SyncError::PayloadTooLarge { .. } => ErrorClass::Data,
            SyncError::ManualResolutionRequired(_) | SyncError::UnresolvedConflict(_) => {
                ErrorClass::Conflict
            }
            SyncError::StorageFailed(_) | SyncError::StorageFull(_) => ErrorClass::Storage,
            SyncError::Cancelled
            | SyncError::DeviceUnregistered(_)
            | SyncError::IllegalTransition { .. }
            | SyncError::IoError(_)
            | SyncError::JsonError(_)
            | SyncError::InternalError(_) => ErrorClass::General,
        }
    }

    /// Whether a retry with backoff is worthwhile. Network failures and
    /// transient storage failures are; auth errors surface immediately and
    /// version errors must re-enter conflict detection instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Timeout { .. }
                | SyncError::StorageFailed(_)
        )
    }

    /// Version errors are not retried blindly; the engine re-runs conflict
    /// detection so the stale side is classified properly.
    pub fn requires_redetect(&self) -> bool {
        matches!(
            self,
            SyncError::StaleWrite { .. } | SyncError::LineageMismatch { .. }
        )
    }

    /// Data corruption is fatal to the session and forces a full
    /// re-download on the next attempt.
    pub fn forces_refetch(&self) -> bool {
        matches!(self, SyncError::HashMismatch { .. })
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
