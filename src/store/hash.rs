// src/store/hash.rs

use std::fmt;
use std::str::FromStr;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Length of a hex-encoded BLAKE3 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Content address of an artifact: the lowercase hex BLAKE3 digest of its
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        ContentHash(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != HASH_HEX_LEN {
            return Err(format!(
                "content hash must be {HASH_HEX_LEN} hex characters (got {})",
                s.len()
            ));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("content hash '{s}' is not hex"));
        }
        Ok(ContentHash(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
