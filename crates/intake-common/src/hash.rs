//! Content fingerprinting for uploaded files and individual rows.
//!
//! Both file and row hashes are hex-encoded SHA-256 digests. Row hashing
//! canonicalizes the fields first so that whitespace and delimiter noise
//! does not defeat deduplication: fields are trimmed and joined with a
//! unit separator before hashing. Malformed rows still hash
//! deterministically so they can be deduplicated like any other row.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Separator used when joining canonicalized fields. Chosen because it
/// cannot appear in field content that came out of a delimited text file.
const FIELD_SEPARATOR: u8 = 0x1f;

/// Hex-encoded SHA-256 digest of a whole uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHash(String);

impl FileHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FileHash {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex-encoded SHA-256 digest of one canonicalized row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowHash(String);

impl RowHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RowHash {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

impl std::fmt::Display for RowHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the content hash of a file from any readable source.
///
/// Streams in 8 KiB blocks so multi-gigabyte uploads never need to fit
/// in memory. Fails only when the source itself is unreadable.
pub fn hash_file<R: Read>(reader: &mut R) -> Result<FileHash> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileHash(hex::encode(hasher.finalize())))
}

/// Compute the content hash of a file already held in memory.
pub fn hash_bytes(bytes: &[u8]) -> FileHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    FileHash(hex::encode(hasher.finalize()))
}

/// Compute the canonical hash of one row.
///
/// Fields are trimmed and joined with a unit separator, so
/// `["a ", " b"]` and `["a", "b"]` produce the same hash while
/// `["ab"]` does not.
pub fn hash_row<S: AsRef<str>>(fields: &[S]) -> RowHash {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.as_ref().trim().as_bytes());
    }
    RowHash(hex::encode(hasher.finalize()))
}

/// Build the domain-supplied natural key used as a secondary
/// deduplication signal (e.g. document number + account).
///
/// Parts are trimmed and lowercased; empty parts are dropped so a
/// missing component never produces a dangling separator. Returns
/// `None` when every part is empty.
pub fn business_key<S: AsRef<str>>(parts: &[S]) -> Option<String> {
    let joined: Vec<String> = parts
        .iter()
        .map(|p| p.as_ref().trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    if joined.is_empty() {
        None
    } else {
        Some(joined.join(":"))
    }
}
