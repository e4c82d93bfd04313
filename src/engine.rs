//! The sync engine.
//!
//! One worker task per device owns the entire workflow; everything else
//! talks to it through a cloneable [`EngineHandle`]. Triggers arrive on
//! a single command lane, so at most one sync session is ever active,
//! and a trigger firing while one runs coalesces into it. The worker
//! also carries the periodic timer, the store push subscription and the
//! offline queue replay.
//!
//! A session walks check, detect, transfer and resolve steps under a
//! per-operation timeout and an overall deadline, with cancellation
//! checked at every step boundary. Rejected stale writes re-enter
//! detection instead of retrying blindly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::retry_with_backoff;
use crate::config::SyncSettings;
use crate::delta::{compute_delta, ConfigDelta};
use crate::detector::{classify, LocalVersionInfo, RemoteVersionInfo, SyncVerdict};
use crate::device::{DeviceIdentity, DeviceRecord, DeviceRegistry};
use crate::error::{SyncError, SyncResult};
use crate::history::{ChangeType, ConflictRecord, HistoryEntry, HistoryLog};
use crate::protocol::{
    CheckStatusRequest, CheckStatusResponse, ConflictNotification, DownloadConfigRequest,
    ManualChoice, ResolveConflictRequest, SyncEvent, UploadConfigRequest,
};
use crate::queue::OfflineQueue;
use crate::resolver::{resolve_with, Resolution, ResolutionStrategy};
use crate::sealed::{PayloadSealer, SealKey};
use crate::snapshot::{content_hash, validate_tree, ConfigSnapshot, SnapshotMetadata};
use crate::state::{SyncDirection, SyncReport, SyncSession, SyncState, TriggerKind};
use crate::store::{LocalStore, SyncedBase};
use crate::transport::SyncTransport;

const COMMAND_LANE_CAPACITY: usize = 16;
const LOCAL_EVENT_CAPACITY: usize = 32;
/// How often a session may re-enter detection after a rejected write
/// before giving up.
const MAX_REDETECTS: u32 = 3;

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Sessions that reached the complete state.
    pub cycles_completed: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub no_changes: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub manual_escalations: u64,
    /// Workflow re-entries after a rejected stale write.
    pub retries: u64,
    pub failures: u64,
    /// Attempts buffered because the transport was offline.
    pub queued: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What a trigger call observed.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The attempt ran; its outcome is in the report.
    Finished(SyncReport),
    /// Another session was in flight; this trigger became a no-op.
    Coalesced,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Finished(report) => Some(report),
            SyncOutcome::Coalesced => None,
        }
    }

    pub fn is_coalesced(&self) -> bool {
        matches!(self, SyncOutcome::Coalesced)
    }
}

/// A conflict the resolver escalated, waiting for a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingManual {
    pub remote_version: u64,
    pub conflict_paths: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    session: uuid::Uuid,
    trigger: TriggerKind,
}

struct EngineShared {
    stats: RwLock<SyncStats>,
    last_report: RwLock<Option<SyncReport>>,
    in_flight: RwLock<Option<InFlight>>,
    pending_manual: RwLock<Option<PendingManual>>,
    /// A trigger is queued on the lane but not yet dequeued.
    lane_busy: AtomicBool,
    cancel_requested: AtomicBool,
    queue_len: AtomicUsize,
    idle_notify: Notify,
}

enum EngineCommand {
    Sync {
        kind: TriggerKind,
        strategy_override: Option<ResolutionStrategy>,
        reply: oneshot::Sender<SyncReport>,
    },
    Settle {
        choice: ManualChoice,
        reply: oneshot::Sender<SyncResult<SyncReport>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<SyncReport>>,
    },
    Shutdown,
}

fn engine_stopped() -> SyncError {
    SyncError::InternalError("sync engine is not running".to_string())
}

fn empty_tree() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Change classification for an outgoing write.
fn classify_change(remote_version: u64, ancestor: &Value, new_tree: &Value) -> ChangeType {
    let now_empty = new_tree.as_object().map(|m| m.is_empty()).unwrap_or(false);
    let was_empty = ancestor.as_object().map(|m| m.is_empty()).unwrap_or(true);
    if remote_version == 0 {
        ChangeType::Create
    } else if now_empty && !was_empty {
        ChangeType::Delete
    } else {
        ChangeType::Update
    }
}

/// Local state captured once per session.
struct LocalView {
    info: LocalVersionInfo,
    working: Value,
    base_tree: Option<Value>,
    modified_at: DateTime<Utc>,
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    shared: Arc<EngineShared>,
    identity: DeviceIdentity,
    devices: Arc<DeviceRegistry>,
    history: Arc<HistoryLog>,
    local_events: broadcast::Sender<SyncEvent>,
}

impl EngineHandle {
    /// Explicit user-requested sync.
    pub async fn sync_now(&self) -> SyncResult<SyncOutcome> {
        self.trigger(TriggerKind::Manual).await
    }

    /// Fire a trigger and wait for its outcome. All triggers except
    /// pre-operation coalesce into an in-flight session.
    pub async fn trigger(&self, kind: TriggerKind) -> SyncResult<SyncOutcome> {
        if kind == TriggerKind::PreOperation {
            self.cancel_background();
        } else if self.is_syncing() {
            debug!(trigger = %kind, "trigger coalesced into in-flight session");
            return Ok(SyncOutcome::Coalesced);
        }

        self.shared.lane_busy.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(EngineCommand::Sync {
                kind,
                strategy_override: None,
                reply: tx,
            })
            .await;
        if sent.is_err() {
            self.release_lane();
            return Err(engine_stopped());
        }
        match rx.await {
            Ok(report) => Ok(SyncOutcome::Finished(report)),
            Err(_) => {
                self.release_lane();
                Err(engine_stopped())
            }
        }
    }

    /// Clear the lane flag when a command never reaches the worker, so
    /// idle waiters are not stranded behind a stopped engine.
    fn release_lane(&self) {
        self.shared.lane_busy.store(false, Ordering::SeqCst);
        self.shared.idle_notify.notify_waiters();
    }

    /// Sync ahead of a consistency-sensitive operation. Cancels a
    /// cancellable background attempt first, then runs.
    pub async fn pre_operation_sync(&self) -> SyncResult<SyncOutcome> {
        self.trigger(TriggerKind::PreOperation).await
    }

    /// Ask a cancellable in-flight attempt to stop at its next step
    /// boundary. Returns whether a cancellation was requested.
    pub fn cancel_background(&self) -> bool {
        let in_flight = self.shared.in_flight.read();
        match &*in_flight {
            Some(flight) if flight.trigger.is_cancellable() => {
                info!(
                    session = %flight.session,
                    trigger = %flight.trigger,
                    "cancelling background sync"
                );
                self.shared.cancel_requested.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Settle an escalated conflict with a human decision and re-sync.
    pub async fn settle_manual(&self, choice: ManualChoice) -> SyncResult<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Settle { choice, reply: tx })
            .await
            .map_err(|_| engine_stopped())?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Replay buffered offline changes now instead of waiting for the
    /// periodic tick. Returns one report per replayed batch.
    pub async fn drain_offline_queue(&self) -> SyncResult<Vec<SyncReport>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Drain { reply: tx })
            .await
            .map_err(|_| engine_stopped())?;
        rx.await.map_err(|_| engine_stopped())
    }

    /// Stop the worker after the current command.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.lane_busy.load(Ordering::SeqCst) || self.shared.in_flight.read().is_some()
    }

    /// Wait until no attempt is in flight and the lane is empty. The
    /// engine counts as busy until its startup sync has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle_notify.notified();
            if !self.is_syncing() {
                return;
            }
            notified.await;
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.shared.last_report.read().clone()
    }

    /// The conflict awaiting manual resolution, if any.
    pub fn pending_manual(&self) -> Option<PendingManual> {
        self.shared.pending_manual.read().clone()
    }

    /// Changes currently buffered for offline replay.
    pub fn queued_changes(&self) -> usize {
        self.shared.queue_len.load(Ordering::SeqCst)
    }

    /// This engine's view of the device fleet.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.list()
    }

    /// Local history mirror, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    /// Version-change events observed by this engine, uploads and
    /// downloads alike, for in-process subscribers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.local_events.subscribe()
    }
}

/// The worker owning one device's sync workflow.
pub struct SyncEngine {
    settings: SyncSettings,
    identity: DeviceIdentity,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn LocalStore>,
    sealer: PayloadSealer,
    devices: Arc<DeviceRegistry>,
    history: Arc<HistoryLog>,
    queue: OfflineQueue,
    shared: Arc<EngineShared>,
    commands: mpsc::Receiver<EngineCommand>,
    local_events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        identity: DeviceIdentity,
        key: &SealKey,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn LocalStore>,
    ) -> (Self, EngineHandle) {
        let sealer = PayloadSealer::new(key)
            .with_compression_threshold(settings.compression_threshold)
            .with_max_payload_bytes(settings.max_payload_bytes);
        let devices = Arc::new(DeviceRegistry::new());
        let history = Arc::new(HistoryLog::new(settings.history_retention));
        let queue = OfflineQueue::new(settings.queue_capacity);
        let shared = Arc::new(EngineShared {
            stats: RwLock::new(SyncStats::default()),
            last_report: RwLock::new(None),
            in_flight: RwLock::new(None),
            pending_manual: RwLock::new(None),
            // Busy until the startup sync has run.
            lane_busy: AtomicBool::new(true),
            cancel_requested: AtomicBool::new(false),
            queue_len: AtomicUsize::new(0),
            idle_notify: Notify::new(),
        });
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_LANE_CAPACITY);
        let (local_events, _) = broadcast::channel(LOCAL_EVENT_CAPACITY);

        let handle = EngineHandle {
            commands: commands_tx,
            shared: shared.clone(),
            identity: identity.clone(),
            devices: devices.clone(),
            history: history.clone(),
            local_events: local_events.clone(),
        };

        let engine = Self {
            settings,
            identity,
            transport,
            store,
            sealer,
            devices,
            history,
            queue,
            shared,
            commands: commands_rx,
            local_events,
        };
        (engine, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// The worker loop. Runs until shut down or every handle is gone.
    pub async fn run(mut self) {
        info!(
            device = %self.identity.device_id,
            name = %self.identity.name,
            user = %self.settings.user_id,
            "sync engine starting"
        );

        self.execute(TriggerKind::Startup, None, false).await;
        self.shared.lane_busy.store(false, Ordering::SeqCst);
        self.shared.idle_notify.notify_waiters();

        let mut periodic = interval_at(
            Instant::now() + self.settings.periodic_interval,
            self.settings.periodic_interval,
        );
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut remote_events = if self.settings.live_events {
            Some(self.transport.subscribe_events())
        } else {
            None
        };

        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        // Every handle dropped; nothing can reach us.
                        None => break,
                    }
                }
                _ = periodic.tick() => {
                    self.on_periodic().await;
                }
                event = Self::next_remote_event(&mut remote_events), if remote_events.is_some() => {
                    match event {
                        Ok(event) => self.on_remote_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "push events lagged, forcing a check");
                            self.execute(TriggerKind::Remote, None, false).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("push event stream closed");
                            remote_events = None;
                        }
                    }
                }
            }
            self.shared.idle_notify.notify_waiters();
        }

        self.shared.lane_busy.store(false, Ordering::SeqCst);
        self.shared.idle_notify.notify_waiters();
        info!(device = %self.identity.device_id, "sync engine stopped");
    }

    async fn next_remote_event(
        events: &mut Option<broadcast::Receiver<SyncEvent>>,
    ) -> Result<SyncEvent, broadcast::error::RecvError> {
        match events {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Returns true when the worker should stop.
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Sync {
                kind,
                strategy_override,
                reply,
            } => {
                let report = self.execute(kind, strategy_override, false).await;
                self.shared.lane_busy.store(false, Ordering::SeqCst);
                let _ = reply.send(report);
                false
            }
            EngineCommand::Settle { choice, reply } => {
                let result = self.settle_manual(choice).await;
                self.shared.lane_busy.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
                false
            }
            EngineCommand::Drain { reply } => {
                let reports = self.drain_queue().await;
                self.shared.lane_busy.store(false, Ordering::SeqCst);
                let _ = reply.send(reports);
                false
            }
            EngineCommand::Shutdown => true,
        }
    }

    async fn on_periodic(&mut self) {
        let stale = self
            .devices
            .mark_stale(self.settings.device_silence_window, Utc::now());
        if !stale.is_empty() {
            info!(count = stale.len(), "marked silent devices inactive");
        }

        if self.transport.is_connected() {
            if !self.queue.is_empty() {
                self.drain_queue().await;
            } else if self.store.is_dirty().unwrap_or(false) {
                self.execute(TriggerKind::Periodic, None, false).await;
            }
        } else if self.queue.is_empty() && self.store.is_dirty().unwrap_or(false) {
            // Record the offline intent once; replay happens on
            // reconnect rather than on every tick.
            self.execute(TriggerKind::Periodic, None, false).await;
        }
    }

    async fn on_remote_event(&mut self, event: SyncEvent) {
        if event.user_id != self.settings.user_id || event.origin_device == self.identity.device_id
        {
            return;
        }
        debug!(
            version = event.version,
            origin = %event.origin_device,
            "remote version announced"
        );
        self.execute(TriggerKind::Remote, None, false).await;
    }

    /// Run one sync attempt end to end and report it.
    async fn execute(
        &mut self,
        kind: TriggerKind,
        strategy_override: Option<ResolutionStrategy>,
        via_queue: bool,
    ) -> SyncReport {
        let mut session = SyncSession::new(kind);
        *self.shared.in_flight.write() = Some(InFlight {
            session: session.id,
            trigger: kind,
        });
        self.shared.cancel_requested.store(false, Ordering::SeqCst);
        debug!(session = %session.id, trigger = %kind, "sync attempt started");

        let deadline = Instant::now() + self.settings.session_deadline;
        let result = self
            .workflow(&mut session, deadline, strategy_override, via_queue)
            .await;

        if let Err(err) = result {
            if session.state().can_transition(SyncState::Error) {
                let _ = session.fail(&err);
            } else {
                session.error = Some(err.to_string());
                session.error_class = Some(err.class());
            }
        }

        // Every attempt, successful or not, counts as device activity.
        self.devices.record_attempt(self.identity.device_id, Utc::now());

        let report = SyncReport::from_session(&session);
        self.update_stats(&report);
        if session.state().is_terminal() {
            let _ = session.transition(SyncState::Idle);
        }

        match (&report.error, report.outcome) {
            (Some(error), _) => warn!(
                session = %report.session_id,
                trigger = %report.trigger,
                error = %error,
                "sync attempt failed"
            ),
            (None, SyncState::Queued) => {}
            (None, _) => info!(
                session = %report.session_id,
                trigger = %report.trigger,
                verdict = ?report.verdict,
                direction = ?report.direction,
                version = report.version_after,
                duration_ms = report.duration_ms,
                "sync attempt finished"
            ),
        }

        *self.shared.last_report.write() = Some(report.clone());
        *self.shared.in_flight.write() = None;
        self.shared
            .queue_len
            .store(self.queue.len(), Ordering::SeqCst);
        report
    }

    async fn workflow(
        &mut self,
        session: &mut SyncSession,
        deadline: Instant,
        strategy_override: Option<ResolutionStrategy>,
        via_queue: bool,
    ) -> SyncResult<()> {
        if via_queue {
            // A replay session starts from the buffered state.
            session.transition(SyncState::Queued)?;
            if !self.transport.is_connected() {
                return Err(SyncError::ConnectionFailed(
                    "transport went offline during replay".to_string(),
                ));
            }
        } else if !self.transport.is_connected() {
            session.transition(SyncState::Queued)?;
            self.buffer_offline(session)?;
            return Ok(());
        }

        session.transition(SyncState::Checking)?;

        let local = self.local_view()?;
        session.version_before = local.info.version;
        self.checkpoint(session, deadline)?;

        let status = self.check_status_op().await?;
        let mut remote = RemoteVersionInfo {
            version: status.current_version,
            content_hash: status.content_hash,
        };

        let strategy = strategy_override.unwrap_or(self.settings.strategy);
        let mut redetects: u32 = 0;
        let mut conflict_counted = false;

        loop {
            self.checkpoint(session, deadline)?;
            let verdict = classify(&local.info, &remote);
            session.verdict = Some(verdict);
            debug!(
                session = %session.id,
                verdict = %verdict,
                local_version = local.info.version,
                remote_version = remote.version,
                "detector verdict"
            );

            match verdict {
                SyncVerdict::NoChanges => {
                    session.version_after = local.info.version;
                    session.transition(SyncState::Complete)?;
                    return Ok(());
                }

                SyncVerdict::DownloadNeeded => {
                    session.transition(SyncState::Downloading)?;
                    self.checkpoint(session, deadline)?;
                    let (snapshot, tree) = self.fetch_verified().await?;
                    self.adopt_remote(&local, &snapshot, &tree)?;
                    session.direction = SyncDirection::Download;
                    session.version_after = snapshot.version;
                    session.transition(SyncState::Complete)?;
                    return Ok(());
                }

                SyncVerdict::UploadNeeded => {
                    session.transition(SyncState::Uploading)?;
                    self.checkpoint(session, deadline)?;

                    let ancestor = local.base_tree.clone().unwrap_or_else(empty_tree);
                    let delta = compute_delta(&ancestor, &local.working);
                    let change_type = classify_change(remote.version, &ancestor, &local.working);

                    match self
                        .upload_tree(&local.working, remote.version, change_type, &delta, None)
                        .await
                    {
                        Ok(snapshot) => {
                            self.finish_upload(
                                session,
                                snapshot,
                                &local.working,
                                change_type,
                                delta,
                                None,
                            )?;
                            return Ok(());
                        }
                        Err(err) if err.requires_redetect() => {
                            remote = self
                                .redetect(session, &mut redetects, &err)
                                .await?;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }

                SyncVerdict::Conflict => {
                    if !conflict_counted {
                        conflict_counted = true;
                        self.shared.stats.write().conflicts_detected += 1;
                        self.devices.record_conflict(self.identity.device_id);
                    }

                    // After a rejected write the session is already
                    // resolving; the payload fetch happens in-state.
                    if session.state() == SyncState::Checking {
                        session.transition(SyncState::Downloading)?;
                    }
                    self.checkpoint(session, deadline)?;
                    let (snapshot, remote_tree) = self.fetch_verified().await?;
                    if session.state() == SyncState::Downloading {
                        session.transition(SyncState::Resolving)?;
                    }
                    self.checkpoint(session, deadline)?;

                    let ctx = self.conflict_context(&local, &snapshot, &remote_tree);
                    let resolution = resolve_with(strategy, &ctx).await;
                    session.conflict_paths = resolution.conflict_paths.clone();
                    session.needs_manual = resolution.needs_manual;

                    self.notify_conflict_op(local.info.version, &snapshot, &resolution)
                        .await;

                    if resolution.needs_manual {
                        self.shared.stats.write().manual_escalations += 1;
                        *self.shared.pending_manual.write() = Some(PendingManual {
                            remote_version: snapshot.version,
                            conflict_paths: resolution.conflict_paths.clone(),
                            detected_at: Utc::now(),
                        });
                        return Err(SyncError::ManualResolutionRequired(
                            resolution.conflict_paths.join(", "),
                        ));
                    }

                    let merged = resolution.merged.ok_or_else(|| {
                        SyncError::UnresolvedConflict(
                            "resolver returned neither a merge nor an escalation".to_string(),
                        )
                    })?;
                    self.shared.stats.write().conflicts_resolved += 1;

                    // A resolution that picked the remote side wholesale
                    // needs no new version; adopt the head instead.
                    if content_hash(&merged)? == snapshot.content_hash {
                        self.adopt_remote(&local, &snapshot, &merged)?;
                        session.direction = SyncDirection::Download;
                        session.version_after = snapshot.version;
                        session.transition(SyncState::Complete)?;
                        return Ok(());
                    }

                    session.transition(SyncState::Uploading)?;
                    self.checkpoint(session, deadline)?;

                    let delta = compute_delta(&remote_tree, &merged);
                    let conflict = ConflictRecord {
                        conflicted_with: local.info.version,
                        strategy: resolution.strategy,
                        // An override only ever comes from settling a
                        // manually escalated conflict.
                        manual_intervention: strategy_override.is_some(),
                    };

                    match self
                        .upload_tree(
                            &merged,
                            snapshot.version,
                            ChangeType::Merge,
                            &delta,
                            Some(conflict.clone()),
                        )
                        .await
                    {
                        Ok(accepted) => {
                            self.finish_upload(
                                session,
                                accepted,
                                &merged,
                                ChangeType::Merge,
                                delta,
                                Some(conflict),
                            )?;
                            return Ok(());
                        }
                        Err(err) if err.requires_redetect() => {
                            remote = self
                                .redetect(session, &mut redetects, &err)
                                .await?;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Between-step guard: cancellation for cancellable triggers, then
    /// the session deadline.
    fn checkpoint(&self, session: &SyncSession, deadline: Instant) -> SyncResult<()> {
        if session.trigger.is_cancellable()
            && self.shared.cancel_requested.load(Ordering::SeqCst)
        {
            return Err(SyncError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(SyncError::Timeout {
                operation: "session".to_string(),
                millis: self.settings.session_deadline.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// A write was rejected as stale: move into resolving and fetch a
    /// fresh head summary so the loop can classify again.
    async fn redetect(
        &self,
        session: &mut SyncSession,
        redetects: &mut u32,
        err: &SyncError,
    ) -> SyncResult<RemoteVersionInfo> {
        *redetects += 1;
        self.shared.stats.write().retries += 1;
        if *redetects > MAX_REDETECTS {
            return Err(SyncError::UnresolvedConflict(format!(
                "store version kept moving through {} attempts",
                MAX_REDETECTS
            )));
        }
        warn!(session = %session.id, error = %err, "write rejected, re-detecting");
        if session.state() == SyncState::Uploading {
            session.transition(SyncState::Resolving)?;
        }
        let status = self.check_status_op().await?;
        Ok(RemoteVersionInfo {
            version: status.current_version,
            content_hash: status.content_hash,
        })
    }

    fn local_view(&self) -> SyncResult<LocalView> {
        let working = self.store.working_tree()?;
        validate_tree(&working)?;
        Ok(LocalView {
            info: self.store.local_info()?,
            base_tree: self.store.base_tree()?,
            modified_at: self.store.modified_at()?,
            working,
        })
    }

    fn buffer_offline(&mut self, session: &mut SyncSession) -> SyncResult<()> {
        let local = self.local_view()?;
        session.version_before = local.info.version;
        let ancestor = local.base_tree.unwrap_or_else(empty_tree);
        let paths = compute_delta(&ancestor, &local.working).changed_paths();
        let sequence = self.queue.enqueue(session.trigger, paths);
        self.shared
            .queue_len
            .store(self.queue.len(), Ordering::SeqCst);
        info!(
            session = %session.id,
            sequence,
            pending = self.queue.len(),
            "offline, change buffered for replay"
        );
        Ok(())
    }

    /// Replay buffered batches in order until the queue is empty, the
    /// transport drops again, or a batch fails.
    async fn drain_queue(&mut self) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        while !self.queue.is_empty() {
            if !self.transport.is_connected() {
                warn!(pending = self.queue.len(), "replay paused, transport offline");
                break;
            }
            let batch = self.queue.drain_batch(self.settings.queue_batch_size);
            self.shared
                .queue_len
                .store(self.queue.len(), Ordering::SeqCst);
            info!(
                from_sequence = batch.first().map(|e| e.sequence).unwrap_or(0),
                to_sequence = batch.last().map(|e| e.sequence).unwrap_or(0),
                remaining = self.queue.len(),
                "replaying buffered changes"
            );

            let report = self.execute(TriggerKind::QueueDrain, None, true).await;
            let failed = !report.succeeded();
            reports.push(report);
            if failed {
                warn!(pending = self.queue.len(), "replay stopped on failure");
                break;
            }
        }
        reports
    }

    /// Report the human's decision to the store, then re-sync with the
    /// matching one-shot strategy. A hand-merged tree is expected to be
    /// in the local store already.
    async fn settle_manual(&mut self, choice: ManualChoice) -> SyncResult<SyncReport> {
        let pending = self.shared.pending_manual.read().clone().ok_or_else(|| {
            SyncError::UnresolvedConflict("no conflict awaiting manual resolution".to_string())
        })?;

        let request = ResolveConflictRequest {
            user_id: self.settings.user_id.clone(),
            device_id: self.identity.device_id,
            conflicted_version: pending.remote_version,
            choice: choice.clone(),
            timestamp: Utc::now(),
        };
        match tokio::time::timeout(
            self.settings.resolve_timeout,
            self.transport.resolve_conflict(request),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "resolution report failed"),
            Err(_) => warn!("resolution report timed out"),
        }

        let strategy = match choice {
            ManualChoice::KeepLocal | ManualChoice::Merged => ResolutionStrategy::LocalWins,
            ManualChoice::KeepRemote => ResolutionStrategy::RemoteWins,
        };
        let report = self.execute(TriggerKind::Manual, Some(strategy), false).await;
        if report.succeeded() {
            *self.shared.pending_manual.write() = None;
        }
        Ok(report)
    }

    async fn check_status_op(&self) -> SyncResult<CheckStatusResponse> {
        let request =
            CheckStatusRequest::new(self.settings.user_id.clone(), self.identity.device_id)?;
        let timeout = self.settings.check_timeout;
        retry_with_backoff(&self.settings.backoff, "check_status", || {
            let request = request.clone();
            let transport = Arc::clone(&self.transport);
            async move {
                match tokio::time::timeout(timeout, transport.check_status(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        operation: "check_status".to_string(),
                        millis: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await
    }

    /// Download the head and open it, re-fetching once when the payload
    /// fails hash verification.
    async fn fetch_verified(&self) -> SyncResult<(ConfigSnapshot, Value)> {
        let snapshot = self.download_op().await?;
        match self
            .sealer
            .open_verified(&snapshot.payload, &snapshot.content_hash)
        {
            Ok(tree) => Ok((snapshot, tree)),
            Err(err) if err.forces_refetch() => {
                warn!(
                    version = snapshot.version,
                    error = %err,
                    "payload failed verification, re-fetching"
                );
                let snapshot = self.download_op().await?;
                let tree = self
                    .sealer
                    .open_verified(&snapshot.payload, &snapshot.content_hash)?;
                Ok((snapshot, tree))
            }
            Err(err) => Err(err),
        }
    }

    async fn download_op(&self) -> SyncResult<ConfigSnapshot> {
        let request =
            DownloadConfigRequest::new(self.settings.user_id.clone(), self.identity.device_id)?;
        let timeout = self.settings.download_timeout;
        let response = retry_with_backoff(&self.settings.backoff, "download_config", || {
            let request = request.clone();
            let transport = Arc::clone(&self.transport);
            async move {
                match tokio::time::timeout(timeout, transport.download(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        operation: "download_config".to_string(),
                        millis: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await?;

        response.snapshot.ok_or_else(|| {
            SyncError::InvalidPayload(
                "store reported a version but returned no snapshot".to_string(),
            )
        })
    }

    /// Seal and propose a new head on top of `remote_version`. Returns
    /// the accepted snapshot; a rejection comes back as the matching
    /// error without any retry.
    async fn upload_tree(
        &self,
        tree: &Value,
        remote_version: u64,
        change_type: ChangeType,
        delta: &ConfigDelta,
        conflict: Option<ConflictRecord>,
    ) -> SyncResult<ConfigSnapshot> {
        let sealed = self.sealer.seal(tree)?;
        let snapshot = ConfigSnapshot::new(
            remote_version + 1,
            remote_version,
            sealed.content_hash.clone(),
            sealed.bytes,
            SnapshotMetadata::from_tree(tree)?,
            self.identity.device_id,
            Utc::now(),
        )?;
        let request = UploadConfigRequest::new(
            self.settings.user_id.clone(),
            self.identity.device_id,
            snapshot.clone(),
            change_type,
            delta.clone(),
            conflict,
        )?;

        let timeout = self.settings.upload_timeout;
        let response = retry_with_backoff(&self.settings.backoff, "upload_config", || {
            let request = request.clone();
            let transport = Arc::clone(&self.transport);
            async move {
                match tokio::time::timeout(timeout, transport.upload(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        operation: "upload_config".to_string(),
                        millis: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await?;

        if let Some(err) = response.to_error(remote_version) {
            return Err(err);
        }
        Ok(snapshot)
    }

    fn finish_upload(
        &self,
        session: &mut SyncSession,
        snapshot: ConfigSnapshot,
        tree: &Value,
        change_type: ChangeType,
        delta: ConfigDelta,
        conflict: Option<ConflictRecord>,
    ) -> SyncResult<()> {
        let base = SyncedBase {
            version: snapshot.version,
            previous_version: snapshot.previous_version,
            content_hash: snapshot.content_hash.clone(),
            synced_at: Utc::now(),
        };
        self.store.commit_synced(tree, base)?;
        self.mirror_history(&snapshot, change_type, &delta, conflict);
        self.devices.record_success(
            &self.identity,
            SyncDirection::Upload,
            snapshot.version,
            Utc::now(),
        );
        self.emit_local_event(
            snapshot.version,
            change_type,
            delta.changed_paths(),
            self.identity.device_id,
        );
        *self.shared.pending_manual.write() = None;
        session.direction = SyncDirection::Upload;
        session.version_after = snapshot.version;
        session.transition(SyncState::Complete)
    }

    /// Make a downloaded head the local state: commit it as the new
    /// base and mirror it into registry, history and local events.
    fn adopt_remote(
        &self,
        local: &LocalView,
        snapshot: &ConfigSnapshot,
        tree: &Value,
    ) -> SyncResult<()> {
        let delta = compute_delta(&local.working, tree);
        let base = SyncedBase {
            version: snapshot.version,
            previous_version: snapshot.previous_version,
            content_hash: snapshot.content_hash.clone(),
            synced_at: Utc::now(),
        };
        self.store.commit_synced(tree, base)?;

        let change_type = if local.info.version == 0 && !local.info.has_content {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        self.mirror_history(snapshot, change_type, &delta, None);
        self.devices.record_success(
            &self.identity,
            SyncDirection::Download,
            snapshot.version,
            Utc::now(),
        );
        self.emit_local_event(
            snapshot.version,
            change_type,
            delta.changed_paths(),
            snapshot.last_modified_by,
        );
        *self.shared.pending_manual.write() = None;
        Ok(())
    }

    /// Local history mirror; downloads of an already-mirrored version
    /// are skipped rather than double-recorded.
    fn mirror_history(
        &self,
        snapshot: &ConfigSnapshot,
        change_type: ChangeType,
        delta: &ConfigDelta,
        conflict: Option<ConflictRecord>,
    ) {
        if self.history.get(snapshot.version).is_some() {
            return;
        }
        let entry = HistoryEntry {
            version: snapshot.version,
            previous_version: snapshot.previous_version,
            timestamp: snapshot.last_modified,
            device_id: snapshot.last_modified_by,
            change_type,
            changed_paths: delta.changed_paths(),
            delta: delta.clone(),
            conflict,
        };
        if let Err(err) = self.history.append(entry) {
            debug!(version = snapshot.version, error = %err, "history mirror skipped");
        }
    }

    fn emit_local_event(
        &self,
        version: u64,
        change_type: ChangeType,
        changed_paths: Vec<String>,
        origin_device: crate::snapshot::DeviceId,
    ) {
        let _ = self.local_events.send(SyncEvent {
            user_id: self.settings.user_id.clone(),
            version,
            change_type,
            changed_paths,
            origin_device,
            timestamp: Utc::now(),
        });
    }

    fn conflict_context(
        &self,
        local: &LocalView,
        snapshot: &ConfigSnapshot,
        remote_tree: &Value,
    ) -> crate::resolver::ConflictContext {
        let ancestor = local.base_tree.clone();
        let empty = empty_tree();
        let diff_base = ancestor.as_ref().unwrap_or(&empty);
        let local_paths = compute_delta(diff_base, &local.working)
            .changed_paths()
            .into_iter()
            .collect();
        let remote_paths = compute_delta(diff_base, remote_tree)
            .changed_paths()
            .into_iter()
            .collect();

        crate::resolver::ConflictContext {
            local_tree: local.working.clone(),
            remote_tree: remote_tree.clone(),
            base_tree: ancestor,
            local_paths,
            remote_paths,
            local_modified: local.modified_at,
            remote_modified: snapshot.last_modified,
            local_device: self.identity.device_id,
            remote_device: snapshot.last_modified_by,
        }
    }

    /// One-way conflict report; never fails the session.
    async fn notify_conflict_op(
        &self,
        local_version: u64,
        snapshot: &ConfigSnapshot,
        resolution: &Resolution,
    ) {
        let notification = ConflictNotification {
            user_id: self.settings.user_id.clone(),
            device_id: self.identity.device_id,
            local_version,
            remote_version: snapshot.version,
            conflict_paths: resolution.conflict_paths.clone(),
            strategy: resolution.strategy,
            needs_manual: resolution.needs_manual,
            timestamp: Utc::now(),
        };
        match tokio::time::timeout(
            self.settings.resolve_timeout,
            self.transport.notify_conflict(notification),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "conflict notification failed"),
            Err(_) => warn!("conflict notification timed out"),
        }
    }

    fn update_stats(&self, report: &SyncReport) {
        let mut stats = self.shared.stats.write();
        match report.outcome {
            SyncState::Complete => {
                stats.cycles_completed += 1;
                stats.last_sync_at = Some(Utc::now());
                stats.last_error = None;
                match report.direction {
                    SyncDirection::Upload => stats.uploads += 1,
                    SyncDirection::Download => stats.downloads += 1,
                    SyncDirection::None => stats.no_changes += 1,
                }
            }
            SyncState::Queued => {
                stats.queued += 1;
            }
            _ => {
                stats.failures += 1;
                stats.last_error = report.error.clone();
            }
        }
    }
}
