//! # Content Digests
//!
//! SHA-256 fingerprints of policy documents.
//!
//! A registered policy is immutable for its (id, version). The registry
//! records the digest of the policy content at registration time; any later
//! document whose digest differs is a tampered or corrupted record.
//!
//! Canonical form is the `serde_json` encoding of the value after a round
//! trip through [`serde_json::Value`], whose object maps are key-sorted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A SHA-256 digest over canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Return the digest as a lowercase hex string.
    pub fn to_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Digest a serializable value in canonical JSON form.
pub fn sha256_json<T: Serialize + ?Sized>(value: &T) -> Result<ContentDigest, serde_json::Error> {
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    Ok(ContentDigest::from_bytes(bytes))
}
