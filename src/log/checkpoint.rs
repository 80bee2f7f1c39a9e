use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::signing::{verify_signature, Signer};
use crate::Hash;

/// Signed snapshot of a log's size and root. Retained forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Log origin identifier
    pub origin: String,
    /// Number of leaves committed to
    pub tree_size: u64,
    /// Root hash at `tree_size`
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// When the checkpoint was signed, second precision
    pub timestamp: DateTime<Utc>,
    /// Detached signature over [`Checkpoint::signed_body`]
    #[serde(with = "crate::bytes_format")]
    pub signature: Vec<u8>,
    /// Public key of the signer
    #[serde(with = "crate::bytes_format")]
    pub public_key: Vec<u8>,
}

impl Checkpoint {
    /// Canonical body that is signed: one field per line in fixed order
    /// (`origin`, decimal size, base64 root, RFC 3339 UTC timestamp), each
    /// terminated by a newline.
    #[must_use]
    pub fn body(origin: &str, tree_size: u64, root_hash: &Hash, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{origin}\n{tree_size}\n{}\n{}\n",
            BASE64.encode(root_hash),
            timestamp.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }

    /// Signs a new checkpoint.
    #[must_use]
    pub fn sign(
        origin: &str,
        tree_size: u64,
        root_hash: Hash,
        timestamp: DateTime<Utc>,
        signer: &dyn Signer,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(0);
        let body = Self::body(origin, tree_size, &root_hash, &timestamp);
        Self {
            origin: origin.to_string(),
            tree_size,
            root_hash,
            timestamp,
            signature: signer.sign(body.as_bytes()),
            public_key: signer.public_key(),
        }
    }

    /// The bytes the signature covers.
    #[must_use]
    pub fn signed_body(&self) -> String {
        Self::body(&self.origin, self.tree_size, &self.root_hash, &self.timestamp)
    }

    /// Checks the signature against `public_key`.
    #[must_use]
    pub fn verify_signature(&self, public_key: &[u8]) -> bool {
        verify_signature(public_key, self.signed_body().as_bytes(), &self.signature)
    }
}
