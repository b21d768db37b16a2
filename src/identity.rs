// Identity key derivation
// Maps an operator-supplied dog name to the primary key of its record

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 of a label, used as the record primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the identity key for a label.
///
/// Hashes the exact UTF-8 bytes as submitted: no trimming, no case folding.
/// Two sightings belong to the same record only if their labels are
/// byte-identical. The geometry plays no part in the key.
pub fn derive_id(label: &str) -> IdentityKey {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    IdentityKey(hex::encode(hasher.finalize()))
}
