// src/store/memory.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::{new_record, Artifact, ArtifactStore, ContentHash, StoreError, StoreResult};

/// One blob and the per-owner records pointing at it.
#[derive(Debug, Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    records: BTreeMap<String, Artifact>,
}

/// Stores artifacts in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    entries: Arc<RwLock<HashMap<ContentHash, Entry>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the bytes held for `hash` without re-hashing.
    ///
    /// Simulates on-disk corruption in tests.
    #[doc(hidden)]
    pub fn corrupt(&self, hash: &ContentHash, bytes: &[u8]) {
        if let Ok(mut map) = self.entries.write() {
            if let Some(entry) = map.get_mut(hash) {
                entry.bytes = Arc::from(bytes);
            }
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(std::io::Error::other("artifact store lock poisoned"))
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, owner: &str, filename: &str, bytes: &[u8]) -> StoreResult<Artifact> {
        let hash = ContentHash::of(bytes);
        let mut map = self.entries.write().map_err(|_| poisoned())?;

        let entry = map.entry(hash.clone()).or_insert_with(|| Entry {
            bytes: Arc::from(bytes),
            records: BTreeMap::new(),
        });
        if entry.bytes.as_ref() != bytes {
            return Err(StoreError::HashMismatch {
                expected: hash,
                actual: ContentHash::of(&entry.bytes),
            });
        }
        if let Some(existing) = entry.records.get(owner) {
            debug!(hash = %hash, owner = %owner, "artifact already stored; put is a no-op");
            return Ok(existing.clone());
        }

        let artifact = new_record(owner, filename, bytes);
        entry.records.insert(owner.to_string(), artifact.clone());
        info!(hash = %hash, size = artifact.size, owner = %owner, "stored artifact (memory)");
        Ok(artifact)
    }

    fn get(&self, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        let map = self.entries.read().map_err(|_| poisoned())?;
        map.get(hash)
            .map(|e| e.bytes.to_vec())
            .ok_or_else(|| StoreError::NotFound(hash.clone()))
    }

    fn stat(&self, owner: &str, hash: &ContentHash) -> StoreResult<Option<Artifact>> {
        let map = self.entries.read().map_err(|_| poisoned())?;
        Ok(map.get(hash).and_then(|e| e.records.get(owner)).cloned())
    }

    fn contains(&self, hash: &ContentHash) -> StoreResult<bool> {
        let map = self.entries.read().map_err(|_| poisoned())?;
        Ok(map.contains_key(hash))
    }

    fn delete(&self, owner: &str, hash: &ContentHash) -> StoreResult<bool> {
        let mut map = self.entries.write().map_err(|_| poisoned())?;
        let Some(entry) = map.get_mut(hash) else {
            return Ok(false);
        };
        if entry.records.remove(owner).is_none() {
            return Ok(false);
        }
        if entry.records.is_empty() {
            map.remove(hash);
        }
        info!(hash = %hash, owner = %owner, "deleted artifact (memory)");
        Ok(true)
    }

    fn list(&self) -> StoreResult<Vec<Artifact>> {
        let map = self.entries.read().map_err(|_| poisoned())?;
        Ok(map
            .values()
            .flat_map(|e| e.records.values().cloned())
            .collect())
    }
}
