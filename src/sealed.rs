//! Payload sealing: canonical bytes, LZ4, AES-256-GCM.
//!
//! The remote store only ever sees sealed blobs; the content hash of the
//! canonical unencrypted tree travels beside them so receivers can verify
//! what they decrypted. Blob layout:
//! `nonce (12 bytes) || ciphertext(flag || body) || tag (16 bytes)` where
//! `flag` is 1 when `body` is LZ4-compressed with a prepended size.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde_json::Value;

use crate::config::MAX_PAYLOAD_BYTES;
use crate::error::{SyncError, SyncResult};
use crate::snapshot::{canonical_bytes, content_hash};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Symmetric key for payload sealing. Supplied by the caller; key
/// management is outside this crate.
#[derive(Clone)]
pub struct SealKey {
    bytes: [u8; KEY_SIZE],
}

impl SealKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SyncError::SealFailure(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Result of sealing a tree: the blob plus the facts about the canonical
/// form the rest of the pipeline needs.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub canonical_size: usize,
}

/// Seals and opens configuration payloads.
pub struct PayloadSealer {
    cipher: Aes256Gcm,
    compression_threshold: usize,
    max_payload_bytes: usize,
}

impl PayloadSealer {
    pub fn new(key: &SealKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self {
            cipher,
            compression_threshold: 4096,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Seal a configuration tree. Enforces the size cap on the canonical
    /// form, then compresses (when large) and encrypts.
    pub fn seal(&self, tree: &Value) -> SyncResult<SealedPayload> {
        let canonical = canonical_bytes(tree)?;
        if canonical.len() > self.max_payload_bytes {
            return Err(SyncError::PayloadTooLarge {
                size: canonical.len(),
                limit: self.max_payload_bytes,
            });
        }
        let hash = content_hash(tree)?;

        let mut body = Vec::with_capacity(canonical.len() + 1);
        if canonical.len() >= self.compression_threshold {
            body.push(FLAG_LZ4);
            body.extend(lz4_flex::compress_prepend_size(&canonical));
        } else {
            body.push(FLAG_RAW);
            body.extend_from_slice(&canonical);
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, body.as_slice())
            .map_err(|_| SyncError::SealFailure("encryption error".to_string()))?;

        let mut bytes = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        bytes.extend_from_slice(&nonce_bytes);
        bytes.extend(ciphertext);

        Ok(SealedPayload {
            bytes,
            content_hash: hash,
            canonical_size: canonical.len(),
        })
    }

    /// Open a sealed blob back into a configuration tree.
    pub fn open(&self, blob: &[u8]) -> SyncResult<Value> {
        if blob.len() < NONCE_SIZE + TAG_SIZE + 1 {
            return Err(SyncError::OpenFailure("blob too short".to_string()));
        }

        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        let body = self
            .cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map_err(|_| SyncError::OpenFailure("decryption error".to_string()))?;

        let (flag, rest) = body.split_first().ok_or_else(|| {
            SyncError::OpenFailure("empty payload body".to_string())
        })?;

        let canonical = match *flag {
            FLAG_RAW => rest.to_vec(),
            FLAG_LZ4 => lz4_flex::decompress_size_prepended(rest)
                .map_err(|e| SyncError::OpenFailure(format!("decompression failed: {}", e)))?,
            other => {
                return Err(SyncError::OpenFailure(format!(
                    "unknown payload flag {}",
                    other
                )))
            }
        };

        Ok(serde_json::from_slice(&canonical)?)
    }

    /// Open a sealed blob and verify it against the advertised content
    /// hash. A mismatch means the blob and hash no longer describe the
    /// same tree, which is fatal to the session.
    pub fn open_verified(&self, blob: &[u8], expected_hash: &str) -> SyncResult<Value> {
        let tree = self.open(blob)?;
        let computed = content_hash(&tree)?;
        if computed != expected_hash {
            return Err(SyncError::HashMismatch {
                expected: expected_hash.to_string(),
                computed,
            });
        }
        Ok(tree)
    }
}

impl std::fmt::Debug for PayloadSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSealer")
            .field("cipher", &"Aes256Gcm")
            .field("compression_threshold", &self.compression_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealer() -> PayloadSealer {
        PayloadSealer::new(&SealKey::generate())
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let sealer = sealer();
        let tree = json!({"editor": {"theme": "dark", "fontSize": 14}});

        let sealed = sealer.seal(&tree).unwrap();
        assert_eq!(sealed.content_hash, content_hash(&tree).unwrap());

        let opened = sealer.open(&sealed.bytes).unwrap();
        assert_eq!(opened, tree);
    }

    #[test]
    fn test_large_payload_compresses() {
        let sealer = sealer().with_compression_threshold(256);
        let tree = json!({"blob": "x".repeat(8192)});

        let sealed = sealer.seal(&tree).unwrap();
        // Compressed ciphertext of repetitive data is far smaller than the
        // canonical form.
        assert!(sealed.bytes.len() < sealed.canonical_size / 2);
        assert_eq!(sealer.open(&sealed.bytes).unwrap(), tree);
    }

    #[test]
    fn test_wrong_key_fails() {
        let tree = json!({"secret": true});
        let sealed = PayloadSealer::new(&SealKey::generate()).seal(&tree).unwrap();

        let other = PayloadSealer::new(&SealKey::generate());
        assert!(other.open(&sealed.bytes).is_err());
    }

    #[test]
    fn test_corrupted_blob_fails() {
        let sealer = sealer();
        let mut sealed = sealer.seal(&json!({"a": 1})).unwrap();
        let len = sealed.bytes.len();
        sealed.bytes[len - 1] ^= 0xFF;

        assert!(matches!(
            sealer.open(&sealed.bytes),
            Err(SyncError::OpenFailure(_))
        ));
    }

    #[test]
    fn test_size_cap_enforced() {
        let sealer = sealer().with_max_payload_bytes(64);
        let tree = json!({"blob": "y".repeat(256)});

        let err = sealer.seal(&tree).unwrap_err();
        assert!(matches!(err, SyncError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_nonce_randomization() {
        let sealer = sealer();
        let tree = json!({"a": 1});
        let one = sealer.seal(&tree).unwrap();
        let two = sealer.seal(&tree).unwrap();
        assert_ne!(one.bytes, two.bytes);
        assert_eq!(one.content_hash, two.content_hash);
    }

    #[test]
    fn test_open_verified_catches_mismatch() {
        let sealer = sealer();
        let sealed = sealer.seal(&json!({"a": 1})).unwrap();
        let wrong_hash = content_hash(&json!({"a": 2})).unwrap();

        let err = sealer.open_verified(&sealed.bytes, &wrong_hash).unwrap_err();
        assert!(matches!(err, SyncError::HashMismatch { .. }));
        assert!(err.forces_refetch());

        assert!(sealer
            .open_verified(&sealed.bytes, &sealed.content_hash)
            .is_ok());
    }

    #[test]
    fn test_key_from_bytes_validates_length() {
        assert!(SealKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SealKey::from_bytes(&[0u8; 32]).is_ok());
    }
}
