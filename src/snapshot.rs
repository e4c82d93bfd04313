//! Config snapshot: the unit of synchronization.
//!
//! A snapshot wraps the sealed payload blob together with the version
//! lineage, the content hash of the canonical (unencrypted) tree, and a
//! small unencrypted metadata summary. All invariants are checked at
//! construction so no half-valid snapshot circulates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Stable identifier for a device, assigned on installation.
pub type DeviceId = Uuid;

/// Canonical serialization of a configuration tree. Object keys are
/// written in explicitly sorted order, so equal trees produce equal bytes
/// regardless of construction order or serde_json's map flavor.
pub fn canonical_bytes(tree: &Value) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(&sort_keys(tree))?)
}

/// Rebuild objects with keys inserted in sorted order; arrays keep their
/// element order. Hashing must not depend on the map type serde_json was
/// compiled with.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (key, child) in entries {
                sorted.insert(key.clone(), sort_keys(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 over the canonical serialization.
pub fn content_hash(tree: &Value) -> SyncResult<String> {
    let bytes = canonical_bytes(tree)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Validate that a tree is addressable by dotted paths: the root is an
/// object and no field name is empty or contains `.`.
pub fn validate_tree(tree: &Value) -> SyncResult<()> {
    if !tree.is_object() {
        return Err(SyncError::InvalidPayload(
            "configuration root must be an object".to_string(),
        ));
    }
    validate_keys(tree)
}

fn validate_keys(value: &Value) -> SyncResult<()> {
    if let Value::Object(map) = value {
        for (key, child) in map {
            if key.is_empty() {
                return Err(SyncError::InvalidPayload(
                    "field names must not be empty".to_string(),
                ));
            }
            if key.contains('.') {
                return Err(SyncError::InvalidPayload(format!(
                    "field name '{}' contains '.', which is reserved for path separators",
                    key
                )));
            }
            validate_keys(child)?;
        }
    }
    Ok(())
}

/// Unencrypted summary of a snapshot, safe to store beside the sealed
/// payload and cheap to show in device listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Number of leaf fields in the tree.
    pub entry_count: usize,
    /// Top-level section names.
    pub sections: Vec<String>,
    /// Active profile selection, when the tree carries one.
    pub active_profile: Option<String>,
    /// Size of the canonical serialization in bytes.
    pub canonical_size: usize,
}

impl SnapshotMetadata {
    pub fn from_tree(tree: &Value) -> SyncResult<Self> {
        let sections = tree
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        let active_profile = crate::delta::paths::get(tree, "profiles.active")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            entry_count: count_leaves(tree),
            sections,
            active_profile,
            canonical_size: canonical_bytes(tree)?.len(),
        })
    }
}

fn count_leaves(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.values().map(count_leaves).sum(),
        _ => 1,
    }
}

/// A versioned configuration snapshot as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Monotonically increasing, unique per successful write.
    pub version: u64,
    /// The version this one was derived from; 0 for the first write.
    pub previous_version: u64,
    /// Hex SHA-256 of the canonical unencrypted tree.
    pub content_hash: String,
    /// Sealed payload blob (compressed and encrypted).
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Unencrypted summary.
    pub metadata: SnapshotMetadata,
    /// Device that produced this version.
    pub last_modified_by: DeviceId,
    pub last_modified: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn new(
        version: u64,
        previous_version: u64,
        content_hash: String,
        payload: Vec<u8>,
        metadata: SnapshotMetadata,
        last_modified_by: DeviceId,
        last_modified: DateTime<Utc>,
    ) -> SyncResult<Self> {
        if version == 0 {
            return Err(SyncError::InvalidPayload(
                "snapshot version must be at least 1".to_string(),
            ));
        }
        if previous_version >= version {
            return Err(SyncError::LineageMismatch {
                local: version,
                remote: previous_version,
            });
        }
        if content_hash.len() != 64 || !content_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SyncError::InvalidPayload(format!(
                "content hash '{}' is not a 64-character hex digest",
                content_hash
            )));
        }
        if payload.is_empty() {
            return Err(SyncError::InvalidPayload(
                "snapshot payload must not be empty".to_string(),
            ));
        }

        Ok(Self {
            version,
            previous_version,
            content_hash,
            payload,
            metadata,
            last_modified_by,
            last_modified,
        })
    }

    /// Whether this snapshot directly extends the given version.
    pub fn extends(&self, version: u64) -> bool {
        self.previous_version == version && self.version == version + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_hash() -> String {
        "a".repeat(64)
    }

    #[test]
    fn test_content_hash_is_order_independent() {
        let a = json!({"zebra": 1, "apple": {"y": 2, "x": 3}});
        let b = json!({"apple": {"x": 3, "y": 2}, "zebra": 1});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_canonical_bytes_sort_keys_explicitly() {
        // Insert keys in reverse order so the bytes only come out sorted
        // if canonicalization sorts them itself, whatever map type
        // serde_json was compiled with.
        let mut reversed = serde_json::Map::new();
        reversed.insert("zoom".to_string(), json!(2));
        reversed.insert("alpha".to_string(), json!({"c": 1, "b": 2}));
        let tree = Value::Object(reversed);

        let bytes = canonical_bytes(&tree).unwrap();
        assert!(bytes.starts_with(b"{\"alpha\""));
        assert_eq!(
            bytes,
            canonical_bytes(&json!({"alpha": {"b": 2, "c": 1}, "zoom": 2})).unwrap()
        );
        assert_eq!(
            content_hash(&tree).unwrap(),
            content_hash(&json!({"alpha": {"b": 2, "c": 1}, "zoom": 2})).unwrap()
        );
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a = json!({"fontSize": 14});
        let b = json!({"fontSize": 16});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_validate_tree_rejects_non_object_root() {
        assert!(validate_tree(&json!([1, 2, 3])).is_err());
        assert!(validate_tree(&json!("scalar")).is_err());
        assert!(validate_tree(&json!({"ok": true})).is_ok());
    }

    #[test]
    fn test_validate_tree_rejects_dotted_keys() {
        let err = validate_tree(&json!({"editor": {"font.size": 14}})).unwrap_err();
        assert!(err.to_string().contains("font.size"));

        assert!(validate_tree(&json!({"editor": {"": 1}})).is_err());
    }

    #[test]
    fn test_metadata_from_tree() {
        let tree = json!({
            "editor": {"theme": "dark", "fontSize": 14},
            "terminal": {"shell": "/bin/zsh"},
            "profiles": {"active": "work", "available": ["work", "home"]}
        });

        let meta = SnapshotMetadata::from_tree(&tree).unwrap();
        assert_eq!(meta.entry_count, 5);
        assert_eq!(meta.sections, vec!["editor", "profiles", "terminal"]);
        assert_eq!(meta.active_profile, Some("work".to_string()));
        assert!(meta.canonical_size > 0);
    }

    #[test]
    fn test_snapshot_constructor_validates() {
        let meta = SnapshotMetadata::from_tree(&json!({"a": 1})).unwrap();
        let device = Uuid::new_v4();

        // version 0 rejected
        assert!(ConfigSnapshot::new(
            0,
            0,
            sample_hash(),
            vec![1],
            meta.clone(),
            device,
            Utc::now()
        )
        .is_err());

        // previous_version must be strictly older
        assert!(ConfigSnapshot::new(
            3,
            3,
            sample_hash(),
            vec![1],
            meta.clone(),
            device,
            Utc::now()
        )
        .is_err());

        // malformed hash rejected
        assert!(ConfigSnapshot::new(
            1,
            0,
            "nothex".to_string(),
            vec![1],
            meta.clone(),
            device,
            Utc::now()
        )
        .is_err());

        // empty payload rejected
        assert!(ConfigSnapshot::new(
            1,
            0,
            sample_hash(),
            vec![],
            meta.clone(),
            device,
            Utc::now()
        )
        .is_err());

        let ok = ConfigSnapshot::new(1, 0, sample_hash(), vec![1], meta, device, Utc::now());
        assert!(ok.is_ok());
    }

    #[test]
    fn test_extends() {
        let meta = SnapshotMetadata::from_tree(&json!({"a": 1})).unwrap();
        let snap =
            ConfigSnapshot::new(6, 5, sample_hash(), vec![1], meta, Uuid::new_v4(), Utc::now())
                .unwrap();
        assert!(snap.extends(5));
        assert!(!snap.extends(4));
    }
}
