// src/launch.rs

//! Launch specifications: the immutable pairing of an artifact and the
//! command to run against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{ArtifactStore, ContentHash, StoreError};

/// Default upper bound on the length of a start command, in bytes.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 4096;

/// Validated, immutable description of what to run. Owned by one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    artifact: ContentHash,
    filename: String,
    start_command: String,
    owner: String,
    created_at: DateTime<Utc>,
}

impl LaunchSpec {
    pub fn artifact(&self) -> &ContentHash {
        &self.artifact
    }

    /// Filename the artifact was uploaded under; used when pushing it into
    /// the environment.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn start_command(&self) -> &str {
        &self.start_command
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("start command must not be empty")]
    EmptyCommand,

    #[error("start command is {len} bytes; the limit is {max}")]
    CommandTooLong { len: usize, max: usize },

    #[error("start command must be a single line without NUL bytes")]
    InvalidCommand,

    #[error("owner identity must not be empty")]
    MissingOwner,

    #[error("malformed artifact hash: {0}")]
    MalformedHash(String),

    #[error("unknown artifact: {0}")]
    UnknownArtifact(ContentHash),

    #[error("artifact lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Check a launch request and build its [`LaunchSpec`].
///
/// Only reads from `store`.
pub fn validate(
    store: &dyn ArtifactStore,
    owner: &str,
    artifact_hash: &str,
    start_command: &str,
    max_command_len: usize,
) -> Result<LaunchSpec, ValidationError> {
    let command = start_command.trim();
    if command.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    if command.len() > max_command_len {
        return Err(ValidationError::CommandTooLong {
            len: command.len(),
            max: max_command_len,
        });
    }
    if command.contains(['\0', '\n', '\r']) {
        return Err(ValidationError::InvalidCommand);
    }
    if owner.trim().is_empty() {
        return Err(ValidationError::MissingOwner);
    }

    let hash: ContentHash = artifact_hash
        .parse()
        .map_err(ValidationError::MalformedHash)?;

    // Only the caller's own uploads can be launched.
    let artifact = store
        .stat(owner, &hash)?
        .ok_or_else(|| ValidationError::UnknownArtifact(hash.clone()))?;

    Ok(LaunchSpec {
        artifact: hash,
        filename: artifact.filename,
        start_command: command.to_string(),
        owner: owner.to_string(),
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;

    fn store_with(bytes: &[u8]) -> (MemoryArtifactStore, ContentHash) {
        let store = MemoryArtifactStore::new();
        let a = store.put("alice", "server.zip", bytes).unwrap();
        (store, a.hash)
    }

    #[test]
    fn accepts_known_artifact() {
        let (store, hash) = store_with(b"0123456789");
        let spec = validate(&store, "alice", hash.as_str(), "  ./run.sh ", 64).unwrap();
        assert_eq!(spec.start_command(), "./run.sh");
        assert_eq!(spec.artifact(), &hash);
        assert_eq!(spec.filename(), "server.zip");
        assert_eq!(spec.owner(), "alice");
    }

    #[test]
    fn rejects_empty_and_oversized_commands() {
        let (store, hash) = store_with(b"x");
        assert!(matches!(
            validate(&store, "alice", hash.as_str(), "   ", 64),
            Err(ValidationError::EmptyCommand)
        ));
        assert!(matches!(
            validate(&store, "alice", hash.as_str(), &"a".repeat(65), 64),
            Err(ValidationError::CommandTooLong { len: 65, max: 64 })
        ));
        assert!(matches!(
            validate(&store, "alice", hash.as_str(), "a\nb", 64),
            Err(ValidationError::InvalidCommand)
        ));
    }

    #[test]
    fn rejects_unknown_and_malformed_hashes() {
        let store = MemoryArtifactStore::new();
        assert!(matches!(
            validate(&store, "alice", "abc123", "./run.sh", 64),
            Err(ValidationError::MalformedHash(_))
        ));

        let missing = ContentHash::of(b"never uploaded");
        assert!(matches!(
            validate(&store, "alice", missing.as_str(), "./run.sh", 64),
            Err(ValidationError::UnknownArtifact(h)) if h == missing
        ));
    }

    #[test]
    fn another_owners_artifact_is_unknown() {
        let (store, hash) = store_with(b"0123456789");
        assert!(matches!(
            validate(&store, "bob", hash.as_str(), "./run.sh", 64),
            Err(ValidationError::UnknownArtifact(_))
        ));

        store.put("bob", "mine.zip", b"0123456789").unwrap();
        let spec = validate(&store, "bob", hash.as_str(), "./run.sh", 64).unwrap();
        assert_eq!(spec.filename(), "mine.zip");
    }
}
