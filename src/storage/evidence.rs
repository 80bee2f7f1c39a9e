use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::object::{ObjectMeta, ObjectStore, PutOptions};
use super::validation::{validate_identifier, validate_payload, DEFAULT_MAX_PAYLOAD};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::log::canonical_json;
use crate::retry::RetryExecutor;

/// Root of every evidence key.
pub const EVIDENCE_ROOT: &str = "evidence/";
/// Record artifact name inside an evidence directory.
pub const RECORD_FILE: &str = "record.json";
/// Manifest artifact name inside an evidence directory.
pub const MANIFEST_FILE: &str = "manifest.bin";
/// Time-stamp token artifact name inside an evidence directory.
pub const TIMESTAMP_FILE: &str = "timestamp.tsr";

/// Default retention: 24 months.
pub const DEFAULT_RETENTION_DAYS: i64 = 730;

/// Hierarchical location of one evidence item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceKey {
    /// Tenant id
    pub tenant_id: String,
    /// Asset id
    pub asset_id: String,
    /// Evidence id
    pub evidence_id: String,
}

impl EvidenceKey {
    /// Builds a validated key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if any segment is not a safe identifier.
    pub fn new(
        tenant_id: impl Into<String>,
        asset_id: impl Into<String>,
        evidence_id: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            tenant_id: tenant_id.into(),
            asset_id: asset_id.into(),
            evidence_id: evidence_id.into(),
        };
        validate_identifier("tenant id", &key.tenant_id)?;
        validate_identifier("asset id", &key.asset_id)?;
        validate_identifier("evidence id", &key.evidence_id)?;
        Ok(key)
    }

    /// Prefix covering one tenant.
    pub fn tenant_prefix(tenant_id: &str) -> String {
        format!("{EVIDENCE_ROOT}{tenant_id}/")
    }

    /// Prefix covering one asset.
    pub fn asset_prefix(tenant_id: &str, asset_id: &str) -> String {
        format!("{EVIDENCE_ROOT}{tenant_id}/{asset_id}/")
    }

    /// Directory holding this item's artifacts, with trailing slash.
    pub fn dir(&self) -> String {
        format!(
            "{EVIDENCE_ROOT}{}/{}/{}/",
            self.tenant_id, self.asset_id, self.evidence_id
        )
    }

    /// Key of `record.json`. This is the item's object key.
    pub fn record_key(&self) -> String {
        format!("{}{RECORD_FILE}", self.dir())
    }

    /// Key of `manifest.bin`.
    pub fn manifest_key(&self) -> String {
        format!("{}{MANIFEST_FILE}", self.dir())
    }

    /// Key of `timestamp.tsr`.
    pub fn timestamp_key(&self) -> String {
        format!("{}{TIMESTAMP_FILE}", self.dir())
    }

    /// Parses any artifact key back into its evidence key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for keys outside the evidence layout.
    pub fn parse(object_key: &str) -> Result<Self> {
        let rest = object_key
            .strip_prefix(EVIDENCE_ROOT)
            .ok_or_else(|| Error::invalid(format!("'{object_key}' is not an evidence key")))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [tenant, asset, evidence, file]
                if [RECORD_FILE, MANIFEST_FILE, TIMESTAMP_FILE].contains(file) =>
            {
                Self::new(*tenant, *asset, *evidence)
            }
            _ => Err(Error::invalid(format!("'{object_key}' is not an evidence key"))),
        }
    }
}

/// What a producer submits for one evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    /// Tenant id
    pub tenant_id: String,
    /// Asset id
    pub asset_id: String,
    /// Evidence id
    pub evidence_id: String,
    /// Hex digest of the asset's manifest
    pub manifest_hash: String,
    /// Raw manifest bytes, stored as `manifest.bin`
    #[serde(default, with = "optional_bytes")]
    pub manifest: Option<Vec<u8>>,
    /// HTTP response headers observed when the asset was fetched
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    /// Opaque verification outcome
    #[serde(default)]
    pub verification_result: serde_json::Value,
    /// What an operator did with the asset, if anything
    #[serde(default)]
    pub operator_action: Option<String>,
}

impl EvidenceSubmission {
    /// Location of this item.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if any id is malformed.
    pub fn key(&self) -> Result<EvidenceKey> {
        EvidenceKey::new(&self.tenant_id, &self.asset_id, &self.evidence_id)
    }

    /// The custody fact this submission describes, with the manifest
    /// reduced to its digest.
    pub fn content(&self) -> EvidenceContent {
        EvidenceContent {
            tenant_id: self.tenant_id.clone(),
            asset_id: self.asset_id.clone(),
            evidence_id: self.evidence_id.clone(),
            manifest_hash: self.manifest_hash.clone(),
            manifest_sha256: self.manifest.as_deref().map(super::object::sha256_hex),
            http_headers: self.http_headers.clone(),
            verification_result: self.verification_result.clone(),
            operator_action: self.operator_action.clone(),
        }
    }
}

/// The timestamp-independent part of an evidence record. Its canonical
/// encoding is what gets hashed, logged and time-stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceContent {
    /// Tenant id
    pub tenant_id: String,
    /// Asset id
    pub asset_id: String,
    /// Evidence id
    pub evidence_id: String,
    /// Hex digest of the asset's manifest
    pub manifest_hash: String,
    /// Hex SHA-256 of `manifest.bin`, when one was stored
    pub manifest_sha256: Option<String>,
    /// HTTP headers snapshot
    pub http_headers: BTreeMap<String, String>,
    /// Opaque verification outcome
    pub verification_result: serde_json::Value,
    /// Operator action
    pub operator_action: Option<String>,
}

impl EvidenceContent {
    /// Canonical (RFC 8785) bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }

    /// Hex SHA-256 of the canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn content_hash(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.canonical_bytes()?)))
    }
}

/// What `record.json` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// The custody fact
    pub content: EvidenceContent,
    /// Hex SHA-256 over the canonical content
    pub content_hash: String,
    /// When this version was written
    pub created_at: DateTime<Utc>,
    /// Retention applied at write time
    pub retention_until: DateTime<Utc>,
}

/// Per-item write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Apply a legal hold atomically with the write
    pub legal_hold: bool,
}

/// Handle returned by a successful store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    /// Key of `record.json`
    pub object_key: String,
    /// Version written
    pub version_id: String,
    /// Hex SHA-256 over the canonical content
    pub content_hash: String,
    /// Hex SHA-256 over the stored `record.json` bytes
    pub record_sha256: String,
    /// Retention applied
    pub retention_until: DateTime<Utc>,
    /// Whether the version was written under legal hold
    pub legal_hold: bool,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// `key@version` of every deleted version
    pub deleted: Vec<String>,
    /// Versions kept only because of a legal hold
    pub held: usize,
    /// Versions still inside retention
    pub retained: usize,
}

/// Result of copying an evidence directory to escrow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorReport {
    /// Versions copied
    pub copied: usize,
    /// Versions already present in escrow
    pub skipped: usize,
}

/// Evidence store tuning.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceStoreConfig {
    /// Retention period applied to every write
    pub retention: Duration,
    /// Upper bound on the submitted payload
    pub max_payload: usize,
}

impl Default for EvidenceStoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// WORM store for evidence records and their sibling artifacts.
pub struct EvidenceStore {
    objects: Arc<dyn ObjectStore>,
    escrow: Option<Arc<dyn ObjectStore>>,
    clock: SharedClock,
    retry: RetryExecutor,
    config: EvidenceStoreConfig,
}

impl EvidenceStore {
    /// Creates a store over `objects`, mirroring held evidence into `escrow`.
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        escrow: Option<Arc<dyn ObjectStore>>,
        clock: SharedClock,
        retry: RetryExecutor,
        config: EvidenceStoreConfig,
    ) -> Self {
        Self {
            objects,
            escrow,
            clock,
            retry,
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EvidenceStoreConfig {
        &self.config
    }

    /// Checks a submission without writing anything.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` describing the first problem found.
    pub fn validate(&self, submission: &EvidenceSubmission) -> Result<EvidenceKey> {
        let key = submission.key()?;
        if submission.manifest_hash.is_empty()
            || !submission.manifest_hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::invalid("manifest hash must be a non-empty hex string"));
        }
        if let Some(manifest) = &submission.manifest {
            validate_payload(manifest, self.config.max_payload)?;
        }
        let content_len = serde_json::to_vec(&submission.content())?.len();
        let total = content_len + submission.manifest.as_ref().map_or(0, Vec::len);
        if total > self.config.max_payload {
            return Err(crate::ValidationError::PayloadTooLarge {
                size: total,
                limit: self.config.max_payload,
            }
            .into());
        }
        Ok(key)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, options: &PutOptions) -> Result<ObjectMeta> {
        let objects = &self.objects;
        self.retry
            .execute("object put", move || {
                let bytes = bytes.clone();
                async move { objects.put(key, bytes, options).await.map_err(Error::from) }
            })
            .await
    }

    /// Validates and writes one evidence item. The manifest is written
    /// first so that a visible record always has its artifacts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` before any write, or `Error::Storage` if
    /// the backend failed after retries.
    pub async fn store(
        &self,
        submission: &EvidenceSubmission,
        options: StoreOptions,
    ) -> Result<StoreReceipt> {
        let key = self.validate(submission)?;
        let now = self.clock.now();
        let retention_until = now + self.config.retention;
        let content = submission.content();
        let content_hash = content.content_hash()?;

        if let Some(manifest) = &submission.manifest {
            let put = PutOptions {
                retain_until: retention_until,
                legal_hold: options.legal_hold,
                content_type: Some("application/octet-stream".to_string()),
            };
            self.put(&key.manifest_key(), manifest.clone(), &put).await?;
        }

        let record = EvidenceRecord {
            content,
            content_hash: content_hash.clone(),
            created_at: now,
            retention_until,
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let put = PutOptions {
            retain_until: retention_until,
            legal_hold: options.legal_hold,
            content_type: Some("application/json".to_string()),
        };
        let meta = self.put(&key.record_key(), bytes, &put).await?;

        tracing::info!(
            object_key = %meta.key,
            version_id = %meta.version_id,
            legal_hold = options.legal_hold,
            retention_until = %retention_until,
            "evidence stored"
        );

        Ok(StoreReceipt {
            object_key: meta.key,
            version_id: meta.version_id,
            content_hash,
            record_sha256: meta.sha256,
            retention_until,
            legal_hold: options.legal_hold,
        })
    }

    /// Raw bytes of the latest version of `object_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown key.
    pub async fn get(&self, object_key: &str) -> Result<Vec<u8>> {
        Ok(self.objects.get(object_key).await?.1)
    }

    /// Raw bytes and metadata of one version.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown key or version.
    pub async fn get_version(&self, object_key: &str, version_id: &str) -> Result<(ObjectMeta, Vec<u8>)> {
        Ok(self.objects.get_version(object_key, version_id).await?)
    }

    /// Parsed latest record.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown key.
    pub async fn record(&self, key: &EvidenceKey) -> Result<EvidenceRecord> {
        let bytes = self.get(&key.record_key()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Latest version metadata.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown key.
    pub async fn head(&self, object_key: &str) -> Result<ObjectMeta> {
        Ok(self.objects.head(object_key).await?)
    }

    /// Every object under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self.objects.list(prefix).await?)
    }

    /// Evidence items under `prefix`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing fails.
    pub async fn evidence_keys(&self, prefix: &str) -> Result<Vec<EvidenceKey>> {
        let mut keys: Vec<EvidenceKey> = self
            .list(prefix)
            .await?
            .into_iter()
            .filter(|meta| meta.key.ends_with(RECORD_FILE))
            .filter_map(|meta| EvidenceKey::parse(&meta.key).ok())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every version of `object_key`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing fails.
    pub async fn versions(&self, object_key: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self.objects.versions(object_key).await?)
    }

    /// Sets or clears the legal hold on every version of every artifact of
    /// one item. Returns the number of versions changed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item has no record.
    pub async fn set_legal_hold(&self, key: &EvidenceKey, on: bool) -> Result<usize> {
        self.head(&key.record_key()).await?;
        let mut changed = 0;
        for artifact in self.list(&key.dir()).await? {
            for version in self.versions(&artifact.key).await? {
                if version.legal_hold != on {
                    self.objects
                        .set_legal_hold(&version.key, &version.version_id, on)
                        .await?;
                    changed += 1;
                }
            }
        }
        tracing::info!(object_key = %key.record_key(), on, changed, "legal hold flag updated");
        Ok(changed)
    }

    /// Metadata of every version of every artifact of one item, as taken
    /// before a hold change so it can be put back with
    /// [`EvidenceStore::restore_legal_hold`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing fails.
    pub async fn legal_hold_snapshot(&self, key: &EvidenceKey) -> Result<Vec<ObjectMeta>> {
        let mut versions = Vec::new();
        for artifact in self.list(&key.dir()).await? {
            versions.extend(self.versions(&artifact.key).await?);
        }
        Ok(versions)
    }

    /// Sets each version's hold flag back to what `snapshot` recorded.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure; later versions are left as they are.
    pub async fn restore_legal_hold(&self, snapshot: &[ObjectMeta]) -> Result<()> {
        for version in snapshot {
            self.objects
                .set_legal_hold(&version.key, &version.version_id, version.legal_hold)
                .await?;
        }
        Ok(())
    }

    /// Stores a time-stamp token next to the record, with the record's
    /// retention and hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item has no record.
    pub async fn attach_timestamp(&self, key: &EvidenceKey, token: &[u8]) -> Result<ObjectMeta> {
        let record = self.head(&key.record_key()).await?;
        let put = PutOptions {
            retain_until: record.retain_until,
            legal_hold: record.legal_hold,
            content_type: Some("application/timestamp-reply".to_string()),
        };
        let meta = self.put(&key.timestamp_key(), token.to_vec(), &put).await?;
        tracing::info!(object_key = %meta.key, "time-stamp token attached");
        Ok(meta)
    }

    /// The item's time-stamp token, if one was attached.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on backend failure.
    pub async fn timestamp_token(&self, key: &EvidenceKey) -> Result<Option<Vec<u8>>> {
        match self.objects.get(&key.timestamp_key()).await {
            Ok((_, bytes)) => Ok(Some(bytes)),
            Err(super::ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The item's manifest, if one was stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on backend failure.
    pub async fn manifest(&self, key: &EvidenceKey) -> Result<Option<Vec<u8>>> {
        match self.objects.get(&key.manifest_key()).await {
            Ok((_, bytes)) => Ok(Some(bytes)),
            Err(super::ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Items that have a record but no time-stamp token.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing fails.
    pub async fn missing_timestamps(&self) -> Result<Vec<EvidenceKey>> {
        let objects = self.list(EVIDENCE_ROOT).await?;
        let stamped: std::collections::HashSet<&str> = objects
            .iter()
            .filter(|m| m.key.ends_with(TIMESTAMP_FILE))
            .map(|m| m.key.as_str())
            .collect();
        let mut missing: Vec<EvidenceKey> = objects
            .iter()
            .filter(|m| m.key.ends_with(RECORD_FILE))
            .filter_map(|m| EvidenceKey::parse(&m.key).ok())
            .filter(|k| !stamped.contains(k.timestamp_key().as_str()))
            .collect();
        missing.sort();
        Ok(missing)
    }

    /// Deletes every version whose retention has passed and whose legal
    /// hold is off. Locked versions are counted, never touched.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if listing or a delete fails.
    pub async fn purge_expired(&self) -> Result<PurgeReport> {
        let now = self.clock.now();
        let mut report = PurgeReport::default();

        for object in self.list(EVIDENCE_ROOT).await? {
            for version in self.versions(&object.key).await? {
                if version.legal_hold {
                    report.held += 1;
                } else if version.retain_until > now {
                    report.retained += 1;
                } else {
                    self.objects
                        .delete_version(&version.key, &version.version_id)
                        .await?;
                    report.deleted.push(format!("{}@{}", version.key, version.version_id));
                }
            }
        }

        tracing::info!(
            deleted = report.deleted.len(),
            held = report.held,
            retained = report.retained,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Copies every version of every artifact of one item into escrow.
    /// Versions whose digest is already present there are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if a read or escrow write fails.
    pub async fn mirror(&self, key: &EvidenceKey) -> Result<MirrorReport> {
        let Some(escrow) = &self.escrow else {
            tracing::warn!(object_key = %key.record_key(), "no escrow store configured, mirror skipped");
            return Ok(MirrorReport::default());
        };

        let mut report = MirrorReport::default();
        for artifact in self.list(&key.dir()).await? {
            let mirrored: Vec<String> = escrow
                .versions(&artifact.key)
                .await?
                .into_iter()
                .map(|m| m.sha256)
                .collect();
            for version in self.versions(&artifact.key).await? {
                if mirrored.contains(&version.sha256) {
                    report.skipped += 1;
                    continue;
                }
                let (_, bytes) = self
                    .objects
                    .get_version(&version.key, &version.version_id)
                    .await?;
                let put = PutOptions {
                    retain_until: version.retain_until,
                    legal_hold: false,
                    content_type: version.content_type.clone(),
                };
                let escrow = escrow.as_ref();
                let key = version.key.as_str();
                let put = &put;
                self.retry
                    .execute("escrow put", move || {
                        let bytes = bytes.clone();
                        async move { escrow.put(key, bytes, put).await.map_err(Error::from) }
                    })
                    .await?;
                report.copied += 1;
            }
        }

        tracing::info!(
            object_key = %key.record_key(),
            copied = report.copied,
            skipped = report.skipped,
            "evidence mirrored to escrow"
        );
        Ok(report)
    }
}

/// Base64 serde for an optional byte buffer.
mod optional_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        Option::<String>::deserialize(deserializer)?
            .map(|s| BASE64.decode(s.as_bytes()).map_err(|e| Error::custom(e.to_string())))
            .transpose()
    }
}
