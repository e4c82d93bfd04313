//! Common test utilities for the sync scenarios.
//!
//! Provides shared helpers for:
//! - Spawning engines wired to one shared in-memory document store
//! - Deterministic settings (push events off, single-attempt backoff)
//! - Polling a condition with a deadline

use std::sync::Arc;
use std::time::Duration;

use confsync::{
    BackoffPolicy, DeviceIdentity, EngineHandle, InMemoryStore, InMemoryTransport, MemoryStore,
    SealKey, SyncEngine, SyncSettings,
};
use serde_json::Value;
use tokio::task::JoinHandle;

pub const USER: &str = "user-1";

/// One engine plus the pieces tests poke at directly.
pub struct TestDevice {
    pub handle: EngineHandle,
    pub local: Arc<MemoryStore>,
    pub transport: Arc<InMemoryTransport>,
    #[allow(dead_code)]
    pub task: JoinHandle<()>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// All devices of a user share one sealing key.
pub fn shared_key() -> SealKey {
    SealKey::from_bytes(&[42u8; 32]).expect("static test key")
}

/// Settings that keep scenario ordering in the test's hands: push
/// events off, periodic tick far away, one network attempt.
pub fn test_settings() -> SyncSettings {
    SyncSettings::new(USER)
        .with_network_timeouts(Duration::from_secs(2))
        .with_session_deadline(Duration::from_secs(10))
        .with_backoff(BackoffPolicy::no_retry())
        .with_periodic_interval(Duration::from_secs(3600))
        .with_live_events(false)
}

/// Spawns an engine for `name` against the shared store and waits for
/// its startup sync to finish.
pub async fn spawn_device(store: &Arc<InMemoryStore>, name: &str, tree: Value) -> TestDevice {
    spawn_device_with(store, name, tree, test_settings()).await
}

pub async fn spawn_device_with(
    store: &Arc<InMemoryStore>,
    name: &str,
    tree: Value,
    settings: SyncSettings,
) -> TestDevice {
    init_tracing();
    let local = Arc::new(MemoryStore::with_tree(tree));
    let transport = Arc::new(InMemoryTransport::new(store.clone()));
    let identity = DeviceIdentity::new(name, "linux", "1.0.0");
    let (engine, handle) = SyncEngine::new(
        settings,
        identity,
        &shared_key(),
        transport.clone(),
        local.clone(),
    );
    let task = engine.spawn();
    handle.wait_idle().await;
    TestDevice {
        handle,
        local,
        transport,
        task,
    }
}

/// Polls `check` every 25ms until it returns true or the deadline
/// passes, panicking with `what` on expiry.
#[allow(dead_code)]
pub async fn wait_until(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
