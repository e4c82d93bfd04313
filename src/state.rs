//! Sync session lifecycle.
//!
//! One `SyncSession` exists per sync attempt and walks a fixed state
//! machine. The legal transition table is closed: any transition outside
//! it is a programming error and fails loudly instead of being coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::detector::SyncVerdict;
use crate::error::{ErrorClass, SyncError, SyncResult};

/// States a sync session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Checking,
    Uploading,
    Downloading,
    Resolving,
    Complete,
    Error,
    Queued,
}

impl SyncState {
    /// The closed transition table.
    pub fn can_transition(self, to: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, to),
            (Idle, Checking)
                | (Idle, Queued)
                | (Checking, Uploading)
                | (Checking, Downloading)
                | (Checking, Complete)
                | (Checking, Error)
                | (Uploading, Complete)
                | (Uploading, Error)
                | (Uploading, Resolving)
                | (Downloading, Complete)
                | (Downloading, Error)
                | (Downloading, Resolving)
                | (Resolving, Uploading)
                | (Resolving, Complete)
                | (Resolving, Error)
                | (Queued, Checking)
                | (Queued, Error)
                | (Complete, Idle)
                | (Error, Idle)
        )
    }

    /// Whether a session in this state is mid-workflow.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SyncState::Checking
                | SyncState::Uploading
                | SyncState::Downloading
                | SyncState::Resolving
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Complete | SyncState::Error)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Checking => "checking",
            SyncState::Uploading => "uploading",
            SyncState::Downloading => "downloading",
            SyncState::Resolving => "resolving",
            SyncState::Complete => "complete",
            SyncState::Error => "error",
            SyncState::Queued => "queued",
        };
        write!(f, "{}", name)
    }
}

/// What caused a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Explicit user request; never cancelled by later triggers.
    Manual,
    /// Debounced file-change notification.
    FileWatch,
    /// Periodic timer; fires only when local changes exist.
    Periodic,
    /// First sync after the engine starts.
    Startup,
    /// A consistency-sensitive operation wants fresh state first.
    PreOperation,
    /// A push event announced a newer remote version.
    Remote,
    /// Replay of offline-queued changes.
    QueueDrain,
}

impl TriggerKind {
    /// Background attempts may be cancelled by a pre-operation trigger;
    /// manual ones may not.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, TriggerKind::Manual)
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::FileWatch => "file_watch",
            TriggerKind::Periodic => "periodic",
            TriggerKind::Startup => "startup",
            TriggerKind::PreOperation => "pre_operation",
            TriggerKind::Remote => "remote",
            TriggerKind::QueueDrain => "queue_drain",
        };
        write!(f, "{}", name)
    }
}

/// Direction of the last transfer, as recorded on device records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Upload,
    Download,
    None,
}

/// Transient per-attempt state, owned by the engine that created it and
/// dropped when the attempt finishes.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub id: Uuid,
    pub trigger: TriggerKind,
    state: SyncState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version_before: u64,
    pub version_after: u64,
    pub verdict: Option<SyncVerdict>,
    pub direction: SyncDirection,
    pub conflict_paths: Vec<String>,
    pub needs_manual: bool,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl SyncSession {
    pub fn new(trigger: TriggerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            state: SyncState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            version_before: 0,
            version_after: 0,
            verdict: None,
            direction: SyncDirection::None,
            conflict_paths: Vec::new(),
            needs_manual: false,
            error: None,
            error_class: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Move to the next state, enforcing the transition table.
    pub fn transition(&mut self, to: SyncState) -> SyncResult<()> {
        if !self.state.can_transition(to) {
            return Err(SyncError::IllegalTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(session = %self.id, from = %self.state, to = %to, "state transition");
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a failure and move to the error state.
    pub fn fail(&mut self, err: &SyncError) -> SyncResult<()> {
        self.error = Some(err.to_string());
        self.error_class = Some(err.class());
        self.transition(SyncState::Error)
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// What one sync attempt reported back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub session_id: Uuid,
    pub trigger: TriggerKind,
    pub outcome: SyncState,
    pub verdict: Option<SyncVerdict>,
    pub direction: SyncDirection,
    pub version_before: u64,
    pub version_after: u64,
    pub conflict_paths: Vec<String>,
    pub needs_manual: bool,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// Local state is never partially overwritten, so this is always
    /// true; it is reported explicitly so callers need not infer it.
    pub local_data_consistent: bool,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn from_session(session: &SyncSession) -> Self {
        Self {
            session_id: session.id,
            trigger: session.trigger,
            outcome: session.state,
            verdict: session.verdict,
            direction: session.direction,
            version_before: session.version_before,
            version_after: session.version_after,
            conflict_paths: session.conflict_paths.clone(),
            needs_manual: session.needs_manual,
            error: session.error.clone(),
            error_class: session.error_class,
            local_data_consistent: true,
            duration_ms: session.duration_ms(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == SyncState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_walk_is_legal() {
        let mut session = SyncSession::new(TriggerKind::Manual);
        assert_eq!(session.state(), SyncState::Idle);

        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Uploading).unwrap();
        session.transition(SyncState::Complete).unwrap();
        assert!(session.finished_at.is_some());

        session.transition(SyncState::Idle).unwrap();
        assert_eq!(session.state(), SyncState::Idle);
    }

    #[test]
    fn test_resolving_walk_is_legal() {
        let mut session = SyncSession::new(TriggerKind::Remote);
        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Downloading).unwrap();
        session.transition(SyncState::Resolving).unwrap();
        session.transition(SyncState::Uploading).unwrap();
        session.transition(SyncState::Complete).unwrap();
    }

    #[test]
    fn test_queued_walk_is_legal() {
        let mut session = SyncSession::new(TriggerKind::FileWatch);
        session.transition(SyncState::Queued).unwrap();
        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Complete).unwrap();
    }

    #[test]
    fn test_illegal_transitions_fail_loudly() {
        let mut session = SyncSession::new(TriggerKind::Manual);

        // Idle cannot jump straight to uploading.
        let err = session.transition(SyncState::Uploading).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Illegal state transition from idle to uploading"
        );

        // Complete cannot go anywhere but idle.
        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Complete).unwrap();
        assert!(session.transition(SyncState::Checking).is_err());

        // Resolving cannot download.
        let mut session = SyncSession::new(TriggerKind::Manual);
        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Downloading).unwrap();
        session.transition(SyncState::Resolving).unwrap();
        assert!(session.transition(SyncState::Downloading).is_err());
    }

    #[test]
    fn test_fail_records_error_and_class() {
        let mut session = SyncSession::new(TriggerKind::Periodic);
        session.transition(SyncState::Checking).unwrap();
        session
            .fail(&SyncError::ConnectionFailed("refused".to_string()))
            .unwrap();

        assert_eq!(session.state(), SyncState::Error);
        assert_eq!(session.error_class, Some(ErrorClass::Network));
        assert!(session.error.as_deref().unwrap().contains("refused"));
    }

    #[test]
    fn test_active_and_terminal_predicates() {
        assert!(SyncState::Checking.is_active());
        assert!(SyncState::Resolving.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Queued.is_active());

        assert!(SyncState::Complete.is_terminal());
        assert!(SyncState::Error.is_terminal());
        assert!(!SyncState::Checking.is_terminal());
    }

    #[test]
    fn test_manual_trigger_is_not_cancellable() {
        assert!(!TriggerKind::Manual.is_cancellable());
        assert!(TriggerKind::Periodic.is_cancellable());
        assert!(TriggerKind::FileWatch.is_cancellable());
    }

    #[test]
    fn test_report_reflects_session() {
        let mut session = SyncSession::new(TriggerKind::Manual);
        session.version_before = 5;
        session.transition(SyncState::Checking).unwrap();
        session.transition(SyncState::Uploading).unwrap();
        session.version_after = 6;
        session.direction = SyncDirection::Upload;
        session.transition(SyncState::Complete).unwrap();

        let report = SyncReport::from_session(&session);
        assert!(report.succeeded());
        assert_eq!(report.version_before, 5);
        assert_eq!(report.version_after, 6);
        assert_eq!(report.direction, SyncDirection::Upload);
        assert!(report.local_data_consistent);
    }
}
