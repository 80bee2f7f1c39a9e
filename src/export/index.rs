use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{Hash, InclusionProof};

/// Format tag written into every index.
pub const INDEX_FORMAT: &str = "custodian-export/1";

/// Signed listing of an export archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportIndex {
    /// Always [`INDEX_FORMAT`]
    pub format: String,
    /// Export id
    pub export_id: String,
    /// Log the proofs refer to
    pub origin: String,
    /// When the archive was assembled
    pub created_at: DateTime<Utc>,
    /// Tree size of the embedded checkpoint
    pub tree_size: u64,
    /// Root of the embedded checkpoint
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// Signature algorithm of `index.sig`
    pub signature_algorithm: String,
    /// Hex public key of the exporter
    pub public_key: String,
    /// Every packaged file except the index and its signature, by path
    pub files: Vec<IndexedFile>,
    /// One entry per evidence directory
    pub records: Vec<IndexedRecord>,
}

/// A file listed in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    /// Path inside the archive
    pub path: String,
    /// Hex SHA-256
    pub sha256: String,
    /// Size in bytes
    pub size: u64,
}

/// An evidence item listed in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRecord {
    /// Directory inside the archive, with trailing slash
    pub dir: String,
    /// Storage key of the record
    pub object_key: String,
    /// Storage version packaged
    pub version_id: String,
    /// Leaf that logged it
    pub leaf_index: u64,
    /// Hex content hash
    pub content_hash: String,
}

/// Contents of `inclusion-proof.json`: the logged entry and its path to
/// the checkpoint root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafProof {
    /// The entry exactly as logged
    pub entry: LogEntry,
    /// Proof against the embedded checkpoint
    pub proof: InclusionProof,
}

/// Names of the fixed files at the archive root.
pub mod names {
    /// Canonical index
    pub const INDEX: &str = "index.json";
    /// Hex signature over the index bytes
    pub const INDEX_SIG: &str = "index.sig";
    /// Signed log checkpoint
    pub const CHECKPOINT: &str = "checkpoint.json";
    /// HTTP header snapshot
    pub const HEADERS: &str = "headers.json";
    /// Verification outcome
    pub const VERIFICATION: &str = "verification.json";
    /// Leaf proof
    pub const INCLUSION_PROOF: &str = "inclusion-proof.json";
}
