//! Content fingerprints
//!
//! Digests are `sha256:<hex>` strings. [`DigestHasher`] builds them
//! incrementally from delimited parts so that adjacent fields can never
//! collide by concatenation.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Label carried by the distinguished content digest
pub const CONTENT_LABEL: &str = "content";

const ALGORITHM_PREFIX: &str = "sha256:";

/// Opaque, comparable fingerprint
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Fingerprint raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_sha256(hasher)
    }

    /// Fingerprint a string
    pub fn from_string(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    fn from_sha256(hasher: Sha256) -> Self {
        Self(format!("{}{}", ALGORITHM_PREFIX, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex portion without the algorithm prefix, shortened for display
    pub fn short(&self) -> &str {
        let hex = self.0.strip_prefix(ALGORITHM_PREFIX).unwrap_or(&self.0);
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher producing a [`Digest`]
#[derive(Clone)]
pub struct DigestHasher {
    hasher: Sha256,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn with_str(mut self, s: &str) -> Self {
        self.hasher.update(s.as_bytes());
        self
    }

    pub fn with_u64(mut self, n: u64) -> Self {
        self.hasher.update(n.to_be_bytes());
        self
    }

    pub fn with_delim(mut self) -> Self {
        self.hasher.update([0u8]);
        self
    }

    pub fn finish(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A post-hoc fact about a produced value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtraDigest {
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl ExtraDigest {
    pub fn new(digest: Digest, label: impl Into<String>) -> Self {
        Self {
            digest,
            label: label.into(),
        }
    }

    /// Unlabeled output-equivalence fact
    pub fn unlabeled(digest: Digest) -> Self {
        Self::new(digest, "")
    }

    /// Content digest: interchangeable with anything sharing this hash
    pub fn content(digest: Digest) -> Self {
        Self::new(digest, CONTENT_LABEL)
    }

    pub fn is_content(&self) -> bool {
        self.label == CONTENT_LABEL
    }
}

/// Merge `learned` facts into `existing`, skipping empty digests and duplicates
pub fn merge_extra_digests(existing: &[ExtraDigest], learned: &[ExtraDigest]) -> Vec<ExtraDigest> {
    let mut out: Vec<ExtraDigest> = existing.to_vec();
    for extra in learned {
        if extra.digest.is_empty() || out.contains(extra) {
            continue;
        }
        out.push(extra.clone());
    }
    out
}
