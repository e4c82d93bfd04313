//! Config file watcher.
//!
//! Watches the local configuration path and turns bursts of filesystem
//! events into single debounced changes: a change is emitted only after
//! the configured quiet window passes without further writes. Wired to
//! an engine handle, each settled change fires a file-watch trigger.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::EngineHandle;
use crate::error::{SyncError, SyncResult};
use crate::state::TriggerKind;

/// One observed change to the watched path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
}

/// Absorb events until `window` passes without a new one; the last
/// change in the burst wins.
async fn settle(
    rx: &mut mpsc::UnboundedReceiver<FileChange>,
    window: Duration,
) -> Option<FileChange> {
    let mut last = rx.recv().await?;
    loop {
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some(change)) => last = change,
            Ok(None) | Err(_) => return Some(last),
        }
    }
}

/// Filesystem watcher on the local configuration path.
pub struct ConfigWatcher {
    // Dropping the watcher stops the event stream.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FileChange>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> SyncResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(FileChange {
                                path,
                                observed_at: Utc::now(),
                            });
                        }
                    }
                }
                Err(err) => warn!(error = %err, "file watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| SyncError::StorageFailed(format!("file watcher: {}", e)))?;

        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| SyncError::StorageFailed(format!("watch {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "watching configuration path");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Next raw change, undebounced.
    pub async fn next_change(&mut self) -> Option<FileChange> {
        self.rx.recv().await
    }

    /// Next change after a quiet window of `window`.
    pub async fn next_debounced(&mut self, window: Duration) -> Option<FileChange> {
        settle(&mut self.rx, window).await
    }

    /// Consume the watcher into a task that fires a file-watch trigger
    /// for every settled change. The task ends when the watcher path is
    /// unwatchable or the engine has shut down.
    pub fn spawn_trigger_task(mut self, window: Duration, handle: EngineHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = self.next_debounced(window).await {
                debug!(path = %change.path.display(), "config change settled");
                if handle.trigger(TriggerKind::FileWatch).await.is_err() {
                    break;
                }
            }
        })
    }
}
