//! Tamper-evident custody records for signed content assets.
//!
//! The crate is organised bottom-up:
//!
//! - [`tree`]: append-only Merkle tree with inclusion and consistency proofs
//! - [`storage`]: WORM evidence store over a compliance-locked object store
//! - [`tsa`]: RFC 3161 time-stamping client
//! - [`log`]: transparency log service (durable entries, signed checkpoints)
//! - [`hold`]: legal hold lifecycle across the log and the store
//! - [`ingest`]: store, log and stamp in one call, with a queue for stamps that failed
//! - [`export`]: signed, offline-verifiable export archives and their verifier
//! - [`service`]: HTTP surface and background sweeps
//!
//! Proof types live at the crate root so that a verifier only needs this
//! module and [`tree`] to check them.

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod hold;
pub mod ingest;
pub mod log;
pub mod retry;
pub mod service;
pub mod signing;
pub mod storage;
pub mod tree;
pub mod tsa;

pub use error::{Error, ErrorKind, Result, ValidationError};

/// A SHA-256 digest.
pub type Hash = [u8; 32];

/// Proof that a leaf is part of the tree of a given size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// The index of the leaf in the tree
    pub leaf_index: u64,
    /// The domain-separated hash of the leaf
    #[serde(with = "hash_format")]
    pub leaf_hash: Hash,
    /// The number of leaves in the tree the proof was generated against
    pub tree_size: u64,
    /// Sibling hashes from the leaf up to the root
    #[serde(with = "hash_list_format")]
    pub path: Vec<Hash>,
}

impl InclusionProof {
    /// Verifies this proof against the expected root of a tree of `tree_size` leaves
    #[must_use]
    pub fn verify(&self, expected_root: &Hash) -> bool {
        tree::verify_inclusion(
            self.leaf_index,
            self.tree_size,
            &self.leaf_hash,
            &self.path,
            expected_root,
        )
    }
}

/// Proof that the tree at `old_size` is a prefix of the tree at `new_size`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyProof {
    /// The number of leaves in the old (smaller) tree
    pub old_size: u64,
    /// The total number of leaves in the new tree
    pub new_size: u64,
    /// The consistency proof path
    #[serde(with = "hash_list_format")]
    pub path: Vec<Hash>,
}

impl ConsistencyProof {
    /// Verifies this proof against the two roots it links
    #[must_use]
    pub fn verify(&self, old_root: &Hash, new_root: &Hash) -> bool {
        tree::verify_consistency(self.old_size, self.new_size, &self.path, old_root, new_root)
    }
}

/// Decodes a 32-byte hash from a slice.
///
/// # Errors
///
/// Returns `Error::Serialization` if the slice is not exactly 32 bytes.
pub fn hash_from_slice(bytes: &[u8]) -> Result<Hash> {
    Hash::try_from(bytes).map_err(|_| {
        Error::Serialization(format!("expected a 32-byte hash, got {} bytes", bytes.len()))
    })
}

/// Base64 serialization for a single hash
pub mod hash_format {
    use super::Hash;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(hash))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bytes = BASE64
            .decode(String::deserialize(deserializer)?.as_bytes())
            .map_err(|err| Error::custom(err.to_string()))?;
        Hash::try_from(bytes.as_slice()).map_err(|_| Error::custom("hash must be 32 bytes"))
    }
}

/// Base64 serialization for a list of hashes
pub mod hash_list_format {
    use super::Hash;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(hashes: &[Hash], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(hashes.iter().map(|h| BASE64.encode(h)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Hash>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| {
                let bytes = BASE64
                    .decode(s.as_bytes())
                    .map_err(|err| Error::custom(err.to_string()))?;
                Hash::try_from(bytes.as_slice()).map_err(|_| Error::custom("hash must be 32 bytes"))
            })
            .collect()
    }
}

/// Base64 serialization for opaque byte payloads
pub mod bytes_format {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        String::deserialize(deserializer).and_then(|string| {
            BASE64
                .decode(string.as_bytes())
                .map_err(|err| Error::custom(err.to_string()))
        })
    }
}
