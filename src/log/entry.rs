use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result, ValidationError};
use crate::storage::validation::validate_identifier;
use crate::Hash;

/// Maximum payload carried by a single log entry.
pub const MAX_ENTRY_PAYLOAD: usize = 64 * 1024;

/// Kind of event a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    /// An evidence object was written to the WORM store
    EvidenceStored,
    /// A legal hold was placed
    HoldPlaced,
    /// A legal hold was released or expired
    HoldReleased,
    /// An export archive was built
    ExportCreated,
}

impl EntryType {
    /// Wire name, as stored in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryType::EvidenceStored => "evidence-stored",
            EntryType::HoldPlaced => "hold-placed",
            EntryType::HoldReleased => "hold-released",
            EntryType::ExportCreated => "export-created",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "evidence-stored" => Ok(EntryType::EvidenceStored),
            "hold-placed" => Ok(EntryType::HoldPlaced),
            "hold-released" => Ok(EntryType::HoldReleased),
            "export-created" => Ok(EntryType::ExportCreated),
            other => Err(Error::Serialization(format!("unknown entry type '{other}'"))),
        }
    }
}

/// One append event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Kind of event
    pub entry_type: EntryType,
    /// When the event was recorded, microsecond precision
    pub timestamp: DateTime<Utc>,
    /// Tenant the event belongs to
    pub tenant_id: String,
    /// Opaque payload
    #[serde(with = "crate::bytes_format")]
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Builds a validated entry.
    ///
    /// The timestamp is truncated to microseconds so it survives a round trip
    /// through durable storage unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the tenant id is malformed or the
    /// payload exceeds [`MAX_ENTRY_PAYLOAD`].
    pub fn new(
        entry_type: EntryType,
        timestamp: DateTime<Utc>,
        tenant_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        validate_identifier("tenant id", &tenant_id)?;
        if payload.len() > MAX_ENTRY_PAYLOAD {
            return Err(ValidationError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_ENTRY_PAYLOAD,
            }
            .into());
        }
        Ok(Self {
            entry_type,
            timestamp: timestamp.trunc_subsecs(6),
            tenant_id,
            payload,
        })
    }

    /// Builds an entry whose payload is the canonical JSON of `body`.
    ///
    /// # Errors
    ///
    /// See [`LogEntry::new`]; also fails if `body` cannot be serialized.
    pub fn with_json<T: Serialize>(
        entry_type: EntryType,
        timestamp: DateTime<Utc>,
        tenant_id: impl Into<String>,
        body: &T,
    ) -> Result<Self> {
        Self::new(entry_type, timestamp, tenant_id, canonical_json(body)?)
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload is not valid JSON for `T`.
    pub fn payload_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Canonical (RFC 8785) encoding. These are the bytes the leaf commits to.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }

    /// Domain-separated leaf hash of the canonical encoding.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn leaf_hash(&self) -> Result<Hash> {
        Ok(crate::tree::hash_leaf(&self.canonical_bytes()?))
    }
}

/// RFC 8785 canonical JSON.
///
/// # Errors
///
/// Returns `Error::Serialization` if `value` cannot be represented.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Payload of an `evidence-stored` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePointer {
    /// Storage key of the evidence record
    pub object_key: String,
    /// Storage version written
    pub version_id: String,
    /// Hex SHA-256 over the canonical evidence content
    pub content_hash: String,
    /// Hex SHA-256 over the stored record bytes
    pub record_sha256: String,
    /// Retention date applied at write time
    pub retention_until: DateTime<Utc>,
}
