// src/store/file.rs

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{new_record, Artifact, ArtifactStore, ContentHash, StoreError, StoreResult};

/// Directory (below the store root) holding artifact blobs.
pub const OBJECTS_DIR: &str = "objects";
/// Directory (below the store root) holding JSON artifact records.
pub const META_DIR: &str = "meta";

/// Stores artifacts on disk:
///
/// `<root>/objects/<hash>` holds the bytes and `<root>/meta/<hash>.json`
/// the [`Artifact`] records of every owner that uploaded them.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
    /// Serializes read-modify-write of record files.
    write_lock: Arc<Mutex<()>>,
}

impl FileArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(META_DIR))?;
        debug!(root = ?root, "opened file artifact store");
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(hash.as_str())
    }

    fn meta_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", hash))
    }

    fn read_records(&self, hash: &ContentHash) -> StoreResult<Vec<Artifact>> {
        let path = self.meta_path(hash);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| StoreError::Metadata {
            hash: hash.clone(),
            message: e.to_string(),
        })
    }

    fn write_records(&self, hash: &ContentHash, records: &[Artifact]) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| StoreError::Metadata {
            hash: hash.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&self.meta_path(hash), &json)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("artifact store lock poisoned")))
    }
}

/// Write `contents` to `path` via a sibling temp file and rename, so a
/// failed write never leaves a truncated entry behind.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl ArtifactStore for FileArtifactStore {
    fn put(&self, owner: &str, filename: &str, bytes: &[u8]) -> StoreResult<Artifact> {
        let hash = ContentHash::of(bytes);
        let blob = self.blob_path(&hash);
        let _guard = self.lock()?;

        let mut records = if blob.is_file() {
            let stored = fs::read(&blob)?;
            if stored != bytes {
                return Err(StoreError::HashMismatch {
                    expected: hash,
                    actual: ContentHash::of(&stored),
                });
            }
            let records = self.read_records(&hash)?;
            if records.is_empty() {
                warn!(hash = %hash, "blob present without metadata; rewriting record");
            }
            records
        } else {
            write_atomic(&blob, bytes)?;
            Vec::new()
        };

        if let Some(existing) = records.iter().find(|a| a.owner == owner) {
            debug!(hash = %hash, owner = %owner, "artifact already stored; put is a no-op");
            return Ok(existing.clone());
        }

        let artifact = new_record(owner, filename, bytes);
        records.push(artifact.clone());
        self.write_records(&hash, &records)?;

        info!(hash = %hash, size = artifact.size, owner = %owner, "stored artifact (file)");
        Ok(artifact)
    }

    fn get(&self, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        match fs::read(self.blob_path(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(hash.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, owner: &str, hash: &ContentHash) -> StoreResult<Option<Artifact>> {
        if !self.contains(hash)? {
            return Ok(None);
        }
        Ok(self
            .read_records(hash)?
            .into_iter()
            .find(|a| a.owner == owner))
    }

    fn contains(&self, hash: &ContentHash) -> StoreResult<bool> {
        Ok(self.blob_path(hash).is_file())
    }

    fn delete(&self, owner: &str, hash: &ContentHash) -> StoreResult<bool> {
        let _guard = self.lock()?;
        let mut records = self.read_records(hash)?;
        let before = records.len();
        records.retain(|a| a.owner != owner);
        if records.len() == before {
            return Ok(false);
        }

        if records.is_empty() {
            remove_if_present(&self.meta_path(hash))?;
            remove_if_present(&self.blob_path(hash))?;
        } else {
            self.write_records(hash, &records)?;
        }
        info!(hash = %hash, owner = %owner, "deleted artifact (file)");
        Ok(true)
    }

    fn list(&self) -> StoreResult<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(self.root.join(META_DIR))? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(hash) = stem.parse::<ContentHash>() else {
                continue;
            };
            if self.contains(&hash)? {
                artifacts.extend(self.read_records(&hash)?);
            }
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();

        let a = store.put("alice", "world.zip", b"0123456789").unwrap();
        assert_eq!(a.size, 10);
        assert_eq!(store.get(&a.hash).unwrap(), b"0123456789");

        let reopened = FileArtifactStore::open(dir.path()).unwrap();
        assert_eq!(reopened.stat("alice", &a.hash).unwrap(), Some(a));
    }

    #[test]
    fn second_put_keeps_single_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();

        let a = store.put("alice", "f", b"same").unwrap();
        let b = store.put("bob", "g", b"same").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(b.owner, "bob");
        assert_eq!(b.filename, "g");

        let blobs = fs::read_dir(dir.path().join(OBJECTS_DIR)).unwrap().count();
        assert_eq!(blobs, 1);
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.delete("alice", &a.hash).unwrap());
        assert_eq!(store.get(&a.hash).unwrap(), b"same");
        assert_eq!(store.list_owned("bob").unwrap(), vec![b]);
    }

    #[test]
    fn tampered_blob_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();
        let a = store.put("alice", "f", b"original").unwrap();

        fs::write(dir.path().join(OBJECTS_DIR).join(a.hash.as_str()), b"garbage").unwrap();

        let err = store.put("alice", "f", b"original").unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
    }

    #[test]
    fn delete_removes_blob_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();
        let a = store.put("alice", "f", b"bytes").unwrap();

        assert!(store.delete("alice", &a.hash).unwrap());
        assert!(!store.contains(&a.hash).unwrap());
        assert!(!dir.path().join(META_DIR).join(format!("{}.json", a.hash)).exists());
        assert!(store.list().unwrap().is_empty());
    }
}
