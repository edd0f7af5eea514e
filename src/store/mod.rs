// src/store/mod.rs

//! Content-addressed artifact storage.
//!
//! Uploaded bundles are keyed by the BLAKE3 digest of their bytes, so the
//! same upload twice lands on the same blob. Each owner that uploads a blob
//! gets its own [`Artifact`] record; the blob is dropped with the last
//! record. Blobs are immutable once written; the only mutations are
//! `delete` and retention-based `prune`.
//!
//! - [`hash`] defines [`ContentHash`].
//! - [`memory`] keeps everything in a map (tests, `mode = "memory"`).
//! - [`file`] persists blobs and metadata under a root directory.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;
pub mod hash;
pub mod memory;

pub use file::FileArtifactStore;
pub use hash::ContentHash;
pub use memory::MemoryArtifactStore;

/// Metadata for a stored artifact. The bytes live in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub hash: ContentHash,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub owner: String,
    pub filename: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(ContentHash),

    #[error("hash mismatch: expected {expected}, payload hashes to {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("artifact storage unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt artifact metadata for {hash}: {message}")]
    Metadata { hash: ContentHash, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Abstract content-addressed artifact storage.
///
/// Records are scoped by owner: `stat`, `delete` and `list_owned` only see
/// the caller's own uploads, even when another owner holds the same bytes.
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` for `owner` and return that owner's record.
    ///
    /// Idempotent: an owner uploading identical content again gets its
    /// existing record back untouched. If the blob for the digest holds
    /// different bytes, this fails with [`StoreError::HashMismatch`].
    fn put(&self, owner: &str, filename: &str, bytes: &[u8]) -> StoreResult<Artifact>;

    fn get(&self, hash: &ContentHash) -> StoreResult<Vec<u8>>;

    /// `owner`'s record for `hash`, if it uploaded that content.
    fn stat(&self, owner: &str, hash: &ContentHash) -> StoreResult<Option<Artifact>>;

    /// Whether a blob is stored for `hash`, whoever uploaded it.
    fn contains(&self, hash: &ContentHash) -> StoreResult<bool>;

    /// Remove `owner`'s record for `hash`. The blob goes with the last
    /// record. Returns `false` when `owner` held no such record.
    fn delete(&self, owner: &str, hash: &ContentHash) -> StoreResult<bool>;

    /// Every stored record, across owners.
    fn list(&self) -> StoreResult<Vec<Artifact>>;

    fn list_owned(&self, owner: &str) -> StoreResult<Vec<Artifact>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| a.owner == owner)
            .collect())
    }

    /// Store `bytes` only if they hash to `expected`.
    fn put_verified(
        &self,
        expected: &ContentHash,
        owner: &str,
        filename: &str,
        bytes: &[u8],
    ) -> StoreResult<Artifact> {
        let actual = ContentHash::of(bytes);
        if &actual != expected {
            return Err(StoreError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.put(owner, filename, bytes)
    }

    /// Delete records uploaded before `now - retention`.
    fn prune(&self, retention: Duration, now: DateTime<Utc>) -> StoreResult<Vec<ContentHash>> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed = Vec::new();
        for artifact in self.list()? {
            if artifact.uploaded_at < cutoff && self.delete(&artifact.owner, &artifact.hash)? {
                removed.push(artifact.hash);
            }
        }

        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "pruned expired artifacts");
        }
        Ok(removed)
    }
}

/// Build a fresh artifact record for `bytes`.
pub(crate) fn new_record(owner: &str, filename: &str, bytes: &[u8]) -> Artifact {
    Artifact {
        hash: ContentHash::of(bytes),
        size: bytes.len() as u64,
        uploaded_at: Utc::now(),
        owner: owner.to_string(),
        filename: filename.to_string(),
    }
}
