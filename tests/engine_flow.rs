//! Engine mechanics: trigger lane, cancellation, timeouts, retries,
//! local mirrors and persistence.
//!
//! Covers:
//! - Trigger coalescing while a session is in flight
//! - Pre-operation sync cancelling a background attempt
//! - Per-operation timeouts and transient-failure retries
//! - History and device registry mirrors on both ends
//! - File-backed local state surviving a restart
//! - The debounced file watcher driving syncs

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use confsync::{
    BackoffPolicy, ConfigWatcher, DeviceIdentity, ErrorClass, FileStore, InMemoryStore,
    InMemoryTransport, LocalStore, SyncDirection, SyncEngine, SyncError, SyncState, TriggerKind,
};
use serde_json::json;

use common::{
    init_tracing, shared_key, spawn_device, spawn_device_with, test_settings, wait_until, USER,
};

// ============================================================================
// Trigger lane
// ============================================================================

#[tokio::test]
async fn test_trigger_coalesces_into_inflight_session() {
    let store = Arc::new(InMemoryStore::new());
    let dev = spawn_device(&store, "desktop", json!({})).await;

    dev.transport.set_latency(Duration::from_millis(250));
    let first = {
        let handle = dev.handle.clone();
        tokio::spawn(async move { handle.sync_now().await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = dev.handle.trigger(TriggerKind::Periodic).await.unwrap();
    assert!(second.is_coalesced());

    let first = first.await.unwrap().unwrap();
    assert!(first.report().unwrap().succeeded());

    // Startup plus the first trigger; the coalesced one never ran.
    assert_eq!(dev.handle.stats().cycles_completed, 2);
    dev.handle.shutdown().await;
}

#[tokio::test]
async fn test_pre_operation_sync_cancels_background_attempt() {
    let store = Arc::new(InMemoryStore::new());
    let dev = spawn_device(&store, "desktop", json!({"a": 1})).await;
    assert_eq!(store.version(USER), 1);

    dev.local.set_working_tree(json!({"a": 2})).unwrap();
    dev.transport.set_latency(Duration::from_millis(300));
    let background = {
        let handle = dev.handle.clone();
        tokio::spawn(async move { handle.trigger(TriggerKind::Periodic).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The foreground sync interrupts the background attempt and then
    // runs to completion itself.
    dev.transport.set_latency(Duration::ZERO);
    let preop = dev.handle.pre_operation_sync().await.unwrap();
    let preop = preop.report().unwrap().clone();
    assert!(preop.succeeded());
    assert_eq!(preop.trigger, TriggerKind::PreOperation);
    assert_eq!(preop.direction, SyncDirection::Upload);

    let background = background.await.unwrap().unwrap();
    let background = background.report().unwrap().clone();
    assert_eq!(background.outcome, SyncState::Error);
    assert!(background.error.is_some());

    // The cancelled attempt never wrote; exactly one new version.
    assert_eq!(store.version(USER), 2);
    let stats = dev.handle.stats();
    assert_eq!(stats.uploads, 2);
    assert_eq!(stats.failures, 1);
    dev.handle.shutdown().await;
}

// ============================================================================
// Timeouts and retries
// ============================================================================

#[tokio::test]
async fn test_slow_store_times_out_the_operation() {
    let store = Arc::new(InMemoryStore::new());
    let settings = test_settings().with_network_timeouts(Duration::from_millis(100));
    let dev = spawn_device_with(&store, "desktop", json!({}), settings).await;

    dev.transport.set_latency(Duration::from_millis(400));
    let outcome = dev.handle.sync_now().await.unwrap();
    let report = outcome.report().unwrap().clone();

    assert_eq!(report.outcome, SyncState::Error);
    assert_eq!(report.error_class, Some(ErrorClass::Network));
    let stats = dev.handle.stats();
    assert_eq!(stats.failures, 1);
    assert!(stats.last_error.is_some());
    dev.handle.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let store = Arc::new(InMemoryStore::new());
    let settings = test_settings().with_backoff(
        BackoffPolicy::new(3)
            .with_initial_delay(Duration::from_millis(50))
            .without_jitter(),
    );
    let dev = spawn_device_with(&store, "desktop", json!({}), settings).await;

    // First request fails, the retry goes through.
    dev.transport.fail_next_requests(1);
    let outcome = dev.handle.sync_now().await.unwrap();
    assert!(outcome.report().unwrap().succeeded());
    assert_eq!(dev.handle.stats().failures, 0);
    dev.handle.shutdown().await;
}

// ============================================================================
// Mirrors
// ============================================================================

#[tokio::test]
async fn test_history_and_registry_mirror_the_store() {
    let store = Arc::new(InMemoryStore::new());
    let dev = spawn_device(&store, "desktop", json!({"editor": {"theme": "dark"}})).await;

    dev.local
        .set_working_tree(json!({"editor": {"theme": "light"}}))
        .unwrap();
    dev.handle.sync_now().await.unwrap();
    dev.local
        .set_working_tree(json!({"editor": {"theme": "light", "font_size": 12}}))
        .unwrap();
    dev.handle.sync_now().await.unwrap();

    let local_history = dev.handle.history();
    let store_history = store.history(USER);
    assert_eq!(local_history.len(), 3);
    assert_eq!(store_history.len(), 3);
    for (ours, theirs) in local_history.iter().zip(&store_history) {
        assert_eq!(ours.version, theirs.version);
        assert_eq!(ours.changed_paths, theirs.changed_paths);
    }
    assert_eq!(local_history[1].changed_paths, vec!["editor.theme".to_string()]);
    assert_eq!(
        local_history[2].changed_paths,
        vec!["editor.font_size".to_string()]
    );

    let devices = dev.handle.devices();
    assert_eq!(devices.len(), 1);
    let record = &devices[0];
    assert_eq!(record.device_id, dev.handle.identity().device_id);
    assert_eq!(record.uploads, 3);
    assert_eq!(record.last_sync_version, 3);
    assert_eq!(record.last_sync_direction, SyncDirection::Upload);
    assert!(record.is_active);

    let store_record = store.device(USER, record.device_id).unwrap();
    assert_eq!(store_record.uploads, 3);
    assert_eq!(store_record.last_sync_version, 3);
    dev.handle.shutdown().await;
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_file_store_state_survives_restart() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mirror.json");
    let store = Arc::new(InMemoryStore::new());

    {
        let local = Arc::new(FileStore::open(&path)?);
        local.set_working_tree(json!({"editor": {"theme": "dark"}}))?;
        let transport = Arc::new(InMemoryTransport::new(store.clone()));
        let identity = DeviceIdentity::new("desktop", "linux", "1.0.0");
        let (engine, handle) =
            SyncEngine::new(test_settings(), identity, &shared_key(), transport, local);
        engine.spawn();
        handle.wait_idle().await;
        assert_eq!(store.version(USER), 1);
        handle.shutdown().await;
    }

    let reopened = FileStore::open(&path)?;
    assert_eq!(
        reopened.working_tree()?,
        json!({"editor": {"theme": "dark"}})
    );
    let base = reopened
        .base()?
        .context("reopened mirror lost its synced base")?;
    assert_eq!(base.version, 1);
    assert!(!reopened.is_dirty()?);
    Ok(())
}

// ============================================================================
// File watcher
// ============================================================================

#[tokio::test]
async fn test_file_watcher_drives_sync() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let conf_path = dir.path().join("settings.json");
    std::fs::write(&conf_path, b"{}")?;

    let store = Arc::new(InMemoryStore::new());
    let dev = spawn_device(&store, "desktop", json!({})).await;
    let watcher = ConfigWatcher::new(&conf_path)?;
    let _watch_task = watcher.spawn_trigger_task(Duration::from_millis(100), dev.handle.clone());

    let before = dev.handle.stats().cycles_completed;
    std::fs::write(&conf_path, br#"{"editor": {"theme": "light"}}"#)?;

    wait_until("file change to trigger a sync", Duration::from_secs(5), || {
        dev.handle.stats().cycles_completed > before
            && dev
                .handle
                .last_report()
                .map_or(false, |r| r.trigger == TriggerKind::FileWatch)
    })
    .await;
    dev.handle.shutdown().await;
    Ok(())
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_handle_errors_after_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let dev = spawn_device(&store, "desktop", json!({})).await;

    dev.handle.shutdown().await;
    dev.task.await.unwrap();

    let err = dev.handle.sync_now().await.unwrap_err();
    assert!(matches!(err, SyncError::InternalError(_)));

    // The refused trigger must not leave the handle looking busy, or
    // idle waiters would hang behind a stopped engine.
    assert!(!dev.handle.is_syncing());
    tokio::time::timeout(Duration::from_secs(1), dev.handle.wait_idle())
        .await
        .expect("wait_idle should return once the failed trigger releases the lane");
}
