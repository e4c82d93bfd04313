//! Version comparison: decides what a sync attempt has to do.
//!
//! Compares the locally recorded version lineage and working-tree hash
//! against the remote head and classifies the attempt as no-op, upload,
//! download, or conflict. This is the single place that decides direction;
//! the orchestrator only executes the verdict.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What the local side knows about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVersionInfo {
    /// Last confirmed synced version; 0 if this device never synced.
    pub version: u64,
    /// Lineage pointer of `version`.
    pub previous_version: u64,
    /// Content hash recorded when `version` was confirmed; `None` if this
    /// device never synced.
    pub base_hash: Option<String>,
    /// Content hash of the current working tree.
    pub working_hash: String,
    /// Whether the working tree holds any fields at all.
    pub has_content: bool,
}

impl LocalVersionInfo {
    /// Whether the working tree diverged from the last confirmed sync.
    /// A never-synced device counts as dirty only once it holds content,
    /// so a fresh install downloads instead of conflicting.
    pub fn is_dirty(&self) -> bool {
        match &self.base_hash {
            Some(base) => &self.working_hash != base,
            None => self.has_content,
        }
    }
}

/// What the status check reported about the remote head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersionInfo {
    /// Current remote version; 0 if no snapshot was ever written.
    pub version: u64,
    /// Content hash of the remote head, when one exists.
    pub content_hash: Option<String>,
}

/// Outcome of comparing local against remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncVerdict {
    /// Versions and hashes agree; nothing to transfer.
    NoChanges,
    /// Local edits extend the remote head; push them.
    UploadNeeded,
    /// Remote is ahead and local is clean; pull it.
    DownloadNeeded,
    /// Divergent lineages; resolution required before any write.
    Conflict,
}

impl SyncVerdict {
    pub fn requires_transfer(&self) -> bool {
        !matches!(self, SyncVerdict::NoChanges)
    }
}

impl std::fmt::Display for SyncVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncVerdict::NoChanges => "no_changes",
            SyncVerdict::UploadNeeded => "upload_needed",
            SyncVerdict::DownloadNeeded => "download_needed",
            SyncVerdict::Conflict => "conflict",
        };
        write!(f, "{}", name)
    }
}

/// Classify a sync attempt.
///
/// The short-circuit comes first: equal versions with the working tree
/// matching the remote hash means nothing to do, regardless of any stale
/// bookkeeping. A local-ahead claim is only trusted when its lineage
/// anchors exactly one step above the remote head; anything else is a
/// divergence and classifies as a conflict.
pub fn classify(local: &LocalVersionInfo, remote: &RemoteVersionInfo) -> SyncVerdict {
    if local.version == remote.version {
        match &remote.content_hash {
            Some(remote_hash) if &local.working_hash == remote_hash => SyncVerdict::NoChanges,
            Some(_) if local.is_dirty() => SyncVerdict::UploadNeeded,
            Some(_) => {
                // Clean working tree, same version, diverged hash: the
                // local mirror is corrupt. Re-download rather than error.
                warn!(
                    version = local.version,
                    "local hash diverged from remote at the same version, forcing re-download"
                );
                SyncVerdict::DownloadNeeded
            }
            None if local.is_dirty() => SyncVerdict::UploadNeeded,
            None => SyncVerdict::NoChanges,
        }
    } else if remote.version > local.version {
        if local.is_dirty() {
            SyncVerdict::Conflict
        } else {
            SyncVerdict::DownloadNeeded
        }
    } else {
        // Local claims to be ahead. Only a lineage anchored directly on
        // the remote head may upload; a broken chain is a conflict
        // masquerading as ahead.
        let anchored =
            local.version == remote.version + 1 && local.previous_version == remote.version;
        if anchored {
            SyncVerdict::UploadNeeded
        } else {
            SyncVerdict::Conflict
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(
        version: u64,
        previous: u64,
        base: Option<&str>,
        working: &str,
        has_content: bool,
    ) -> LocalVersionInfo {
        LocalVersionInfo {
            version,
            previous_version: previous,
            base_hash: base.map(str::to_string),
            working_hash: working.to_string(),
            has_content,
        }
    }

    fn remote(version: u64, hash: Option<&str>) -> RemoteVersionInfo {
        RemoteVersionInfo {
            version,
            content_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn test_no_changes_short_circuit() {
        let verdict = classify(
            &local(5, 4, Some("h5"), "h5", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::NoChanges);
        assert!(!verdict.requires_transfer());
    }

    #[test]
    fn test_dirty_on_head_uploads() {
        let verdict = classify(
            &local(5, 4, Some("h5"), "h5-edited", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::UploadNeeded);
    }

    #[test]
    fn test_remote_ahead_clean_downloads() {
        let verdict = classify(
            &local(5, 4, Some("h5"), "h5", true),
            &remote(6, Some("h6")),
        );
        assert_eq!(verdict, SyncVerdict::DownloadNeeded);
    }

    #[test]
    fn test_remote_ahead_dirty_conflicts() {
        let verdict = classify(
            &local(5, 4, Some("h5"), "h5-edited", true),
            &remote(6, Some("h6")),
        );
        assert_eq!(verdict, SyncVerdict::Conflict);
    }

    #[test]
    fn test_local_ahead_with_anchored_lineage_uploads() {
        let verdict = classify(
            &local(6, 5, Some("h6"), "h6", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::UploadNeeded);
    }

    #[test]
    fn test_local_ahead_with_broken_lineage_conflicts() {
        // Two versions ahead of the store: the chain cannot anchor.
        let verdict = classify(
            &local(7, 6, Some("h7"), "h7", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::Conflict);

        // One ahead but pointing at the wrong parent.
        let verdict = classify(
            &local(6, 4, Some("h6"), "h6", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::Conflict);
    }

    #[test]
    fn test_corrupt_local_mirror_self_heals() {
        let verdict = classify(
            &local(5, 4, Some("h5-corrupt"), "h5-corrupt", true),
            &remote(5, Some("h5")),
        );
        assert_eq!(verdict, SyncVerdict::DownloadNeeded);
    }

    #[test]
    fn test_fresh_install_with_empty_store() {
        // Nothing anywhere.
        let verdict = classify(&local(0, 0, None, "h-empty", false), &remote(0, None));
        assert_eq!(verdict, SyncVerdict::NoChanges);

        // First device with content creates version 1.
        let verdict = classify(&local(0, 0, None, "h-content", true), &remote(0, None));
        assert_eq!(verdict, SyncVerdict::UploadNeeded);
    }

    #[test]
    fn test_fresh_install_joining_existing_store() {
        // Untouched install downloads.
        let verdict = classify(
            &local(0, 0, None, "h-empty", false),
            &remote(3, Some("h3")),
        );
        assert_eq!(verdict, SyncVerdict::DownloadNeeded);

        // Pre-existing local content conflicts and goes through resolution.
        let verdict = classify(
            &local(0, 0, None, "h-local", true),
            &remote(3, Some("h3")),
        );
        assert_eq!(verdict, SyncVerdict::Conflict);
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(SyncVerdict::UploadNeeded.to_string(), "upload_needed");
        assert_eq!(SyncVerdict::Conflict.to_string(), "conflict");
    }
}
