use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::archive::{self, ArchiveFiles};
use super::download::{DownloadLink, DownloadLinks};
use super::index::{names, ExportIndex, IndexedFile, IndexedRecord, LeafProof, INDEX_FORMAT};
use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use crate::log::{canonical_json, EntryType, EvidencePointer, LogEntry, TransparencyLog};
use crate::signing::Signer;
use crate::storage::object::sha256_hex;
use crate::storage::validation::validate_identifier;
use crate::storage::evidence::{MANIFEST_FILE, RECORD_FILE, TIMESTAMP_FILE};
use crate::storage::{EvidenceKey, EvidenceRecord, EvidenceStore};
use crate::tsa::TstInfo;

/// Default cap on records per export.
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// One item named explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Asset id
    pub asset_id: String,
    /// Evidence id
    pub evidence_id: String,
}

/// Which evidence an export packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportScope {
    /// Every item of one asset
    Asset {
        /// Tenant id
        tenant_id: String,
        /// Asset id
        asset_id: String,
    },
    /// Every item of one tenant
    Tenant {
        /// Tenant id
        tenant_id: String,
    },
    /// An explicit list within one tenant
    EvidenceIds {
        /// Tenant id
        tenant_id: String,
        /// Items
        items: Vec<EvidenceRef>,
    },
}

impl ExportScope {
    /// Tenant the scope belongs to.
    pub fn tenant_id(&self) -> &str {
        match self {
            ExportScope::Asset { tenant_id, .. }
            | ExportScope::Tenant { tenant_id }
            | ExportScope::EvidenceIds { tenant_id, .. } => tenant_id,
        }
    }
}

/// Lifecycle of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    /// Being assembled
    Building,
    /// Archive available
    Ready,
    /// Assembly failed; see `error`
    Failed,
    /// Cancelled before completion
    Cancelled,
}

/// Pollable view of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStatus {
    /// Export id
    pub export_id: String,
    /// Requested scope
    pub scope: ExportScope,
    /// Current state
    pub state: ExportState,
    /// 0 to 100
    pub progress: u8,
    /// Items in the scope
    pub records: usize,
    /// Failure message
    pub error: Option<String>,
    /// Hex SHA-256 of `index.json`, once ready
    pub index_sha256: Option<String>,
    /// Archive size, once ready
    pub archive_size: Option<u64>,
    /// Leaf of the `export-created` entry, once ready
    pub leaf_index: Option<u64>,
    /// When the export was requested
    pub created_at: DateTime<Utc>,
    /// When it stopped building
    pub finished_at: Option<DateTime<Utc>>,
}

/// Payload of an `export-created` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCreated {
    /// Export id
    pub export_id: String,
    /// Hex SHA-256 of `index.json`
    pub index_sha256: String,
    /// Items packaged
    pub records: usize,
    /// Checkpoint size the proofs refer to
    pub tree_size: u64,
}

struct Job {
    status: ExportStatus,
    archive: Option<Arc<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
    /// Set once the `export-created` entry is being written; cancel is
    /// refused from then on.
    committing: bool,
    task: Option<JoinHandle<()>>,
}

/// A record with everything that gets packaged for it.
struct Collected {
    key: EvidenceKey,
    leaf_index: u64,
    entry: LogEntry,
    pointer: EvidencePointer,
    record_bytes: Vec<u8>,
    record: EvidenceRecord,
    manifest: Option<Vec<u8>>,
    token: Option<Vec<u8>>,
}

/// A signed archive that has not been logged yet.
struct Prepared {
    archive: Vec<u8>,
    index_sha256: String,
    records: usize,
    tree_size: u64,
}

struct Built {
    archive: Vec<u8>,
    index_sha256: String,
    leaf_index: u64,
}

/// Assembles signed, offline-verifiable archives.
pub struct ExportBuilder {
    store: Arc<EvidenceStore>,
    log: Arc<TransparencyLog>,
    signer: Arc<dyn Signer>,
    clock: SharedClock,
    max_records: usize,
    jobs: RwLock<HashMap<String, Job>>,
    links: DownloadLinks,
}

impl ExportBuilder {
    /// Creates a builder signing indexes with `signer`.
    pub fn new(
        store: Arc<EvidenceStore>,
        log: Arc<TransparencyLog>,
        signer: Arc<dyn Signer>,
        clock: SharedClock,
        max_records: usize,
    ) -> Self {
        Self {
            store,
            log,
            signer,
            links: DownloadLinks::new(clock.clone()),
            clock,
            max_records,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Hex public key matching `index.sig`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signer.public_key())
    }

    /// Resolves `scope` and starts assembling its archive in the background.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a malformed scope or one larger than
    /// the record cap, and `Error::NotFound` if it matches nothing or names
    /// an unknown item. Nothing is started on error.
    pub async fn build(self: &Arc<Self>, scope: ExportScope) -> Result<ExportStatus> {
        let keys = self.resolve(&scope).await?;
        let (status, cancelled) = self.register(scope, keys.len());
        let export_id = status.export_id.clone();

        let this = Arc::clone(self);
        let id = export_id.clone();
        let tenant_id = status.scope.tenant_id().to_string();
        let task =
            tokio::spawn(async move { this.run(&id, &tenant_id, keys, &cancelled).await });
        if let Some(job) = self.jobs.write().get_mut(&export_id) {
            job.task = Some(task);
        }
        Ok(status)
    }

    fn register(&self, scope: ExportScope, records: usize) -> (ExportStatus, Arc<AtomicBool>) {
        let export_id = uuid::Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        let status = ExportStatus {
            export_id: export_id.clone(),
            scope,
            state: ExportState::Building,
            progress: 0,
            records,
            error: None,
            index_sha256: None,
            archive_size: None,
            leaf_index: None,
            created_at: self.clock.now(),
            finished_at: None,
        };
        self.jobs.write().insert(
            export_id.clone(),
            Job {
                status: status.clone(),
                archive: None,
                cancelled: cancelled.clone(),
                committing: false,
                task: None,
            },
        );
        info!(export_id = %export_id, records, "export started");
        (status, cancelled)
    }

    async fn resolve(&self, scope: &ExportScope) -> Result<Vec<EvidenceKey>> {
        let keys = match scope {
            ExportScope::Asset {
                tenant_id,
                asset_id,
            } => {
                validate_identifier("tenant id", tenant_id)?;
                validate_identifier("asset id", asset_id)?;
                self.store
                    .evidence_keys(&EvidenceKey::asset_prefix(tenant_id, asset_id))
                    .await?
            }
            ExportScope::Tenant { tenant_id } => {
                validate_identifier("tenant id", tenant_id)?;
                self.store
                    .evidence_keys(&EvidenceKey::tenant_prefix(tenant_id))
                    .await?
            }
            ExportScope::EvidenceIds { tenant_id, items } => {
                if items.len() > self.max_records {
                    return Err(self.too_many(items.len()));
                }
                let mut keys = Vec::with_capacity(items.len());
                for item in items {
                    let key = EvidenceKey::new(tenant_id, &item.asset_id, &item.evidence_id)?;
                    self.store.head(&key.record_key()).await?;
                    keys.push(key);
                }
                keys.sort();
                keys.dedup();
                keys
            }
        };
        if keys.len() > self.max_records {
            return Err(self.too_many(keys.len()));
        }
        if keys.is_empty() {
            return Err(Error::not_found("evidence matching the export scope"));
        }
        Ok(keys)
    }

    fn too_many(&self, count: usize) -> Error {
        Error::invalid(format!(
            "export scope holds {count} records, the limit is {}",
            self.max_records
        ))
    }

    async fn run(
        &self,
        export_id: &str,
        tenant_id: &str,
        keys: Vec<EvidenceKey>,
        cancelled: &AtomicBool,
    ) {
        let outcome = self.assemble(export_id, tenant_id, keys, cancelled).await;
        let now = self.clock.now();

        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(export_id) else {
            return;
        };
        if job.status.state == ExportState::Cancelled {
            return;
        }
        job.status.finished_at = Some(now);
        match outcome {
            Ok(Some(built)) => {
                job.status.state = ExportState::Ready;
                job.status.progress = 100;
                job.status.index_sha256 = Some(built.index_sha256);
                job.status.archive_size = Some(built.archive.len() as u64);
                job.status.leaf_index = Some(built.leaf_index);
                job.archive = Some(Arc::new(built.archive));
                info!(export_id, "export ready");
            }
            Ok(None) => job.status.state = ExportState::Cancelled,
            Err(e) => {
                warn!(export_id, error = %e, "export failed");
                job.status.state = ExportState::Failed;
                job.status.error = Some(e.to_string());
            }
        }
    }

    async fn assemble(
        &self,
        export_id: &str,
        tenant_id: &str,
        keys: Vec<EvidenceKey>,
        cancelled: &AtomicBool,
    ) -> Result<Option<Built>> {
        match self.prepare(export_id, keys, cancelled).await? {
            Some(prepared) => self.commit(export_id, tenant_id, prepared).await,
            None => Ok(None),
        }
    }

    fn set_progress(&self, export_id: &str, progress: u8) {
        if let Some(job) = self.jobs.write().get_mut(export_id) {
            job.status.progress = progress.min(99);
        }
    }

    /// Steps 1 to 6. `Ok(None)` means the export was cancelled. Cancellation
    /// is checked between stages; nothing here writes to the log except a
    /// checkpoint when none covers the packaged leaves.
    async fn prepare(
        &self,
        export_id: &str,
        keys: Vec<EvidenceKey>,
        cancelled: &AtomicBool,
    ) -> Result<Option<Prepared>> {
        let total = keys.len();
        let mut collected = Vec::with_capacity(total);
        for (done, key) in keys.into_iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            collected.push(self.collect(key).await?);
            self.set_progress(export_id, ((done + 1) * 80 / total) as u8);
        }

        if cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let max_leaf = collected.iter().map(|c| c.leaf_index).max().unwrap_or(0);
        let checkpoint = match self.log.latest_checkpoint() {
            Some(cp) if cp.tree_size > max_leaf => cp,
            _ => self.log.checkpoint().await?,
        };

        let mut files = ArchiveFiles::new();
        files.insert(
            names::CHECKPOINT.to_string(),
            serde_json::to_vec_pretty(&checkpoint)?,
        );
        let mut records = Vec::with_capacity(collected.len());
        for item in collected {
            let proof = self
                .log
                .inclusion_proof_at(item.leaf_index, checkpoint.tree_size)?;
            let dir = item.key.dir();
            files.insert(
                format!("{dir}{}", names::INCLUSION_PROOF),
                serde_json::to_vec_pretty(&LeafProof {
                    entry: item.entry,
                    proof,
                })?,
            );
            files.insert(
                format!("{dir}{}", names::HEADERS),
                serde_json::to_vec_pretty(&item.record.content.http_headers)?,
            );
            files.insert(
                format!("{dir}{}", names::VERIFICATION),
                serde_json::to_vec_pretty(&item.record.content.verification_result)?,
            );
            files.insert(format!("{dir}{RECORD_FILE}"), item.record_bytes);
            if let Some(manifest) = item.manifest {
                files.insert(format!("{dir}{MANIFEST_FILE}"), manifest);
            }
            if let Some(token) = item.token {
                files.insert(format!("{dir}{TIMESTAMP_FILE}"), token);
            }
            records.push(IndexedRecord {
                dir,
                object_key: item.pointer.object_key,
                version_id: item.pointer.version_id,
                leaf_index: item.leaf_index,
                content_hash: item.pointer.content_hash,
            });
        }
        self.set_progress(export_id, 90);

        let index = ExportIndex {
            format: INDEX_FORMAT.to_string(),
            export_id: export_id.to_string(),
            origin: checkpoint.origin.clone(),
            created_at: self.clock.now(),
            tree_size: checkpoint.tree_size,
            root_hash: checkpoint.root_hash,
            signature_algorithm: self.signer.algorithm().to_string(),
            public_key: self.public_key_hex(),
            files: files
                .iter()
                .map(|(path, data)| IndexedFile {
                    path: path.clone(),
                    sha256: sha256_hex(data),
                    size: data.len() as u64,
                })
                .collect(),
            records,
        };
        let index_bytes = canonical_json(&index)?;
        let index_sha256 = sha256_hex(&index_bytes);
        let signature = hex::encode(self.signer.sign(&index_bytes));
        files.insert(names::INDEX.to_string(), index_bytes);
        files.insert(names::INDEX_SIG.to_string(), signature.into_bytes());
        let archive = archive::pack(&files)?;

        if cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Prepared {
            archive,
            index_sha256,
            records: index.records.len(),
            tree_size: checkpoint.tree_size,
        }))
    }

    /// Marks the job as committing unless it was cancelled first. The
    /// decision is taken under the jobs lock, so exactly one of cancel and
    /// commit wins.
    fn begin_commit(&self, export_id: &str) -> bool {
        match self.jobs.write().get_mut(export_id) {
            Some(job)
                if job.status.state == ExportState::Building
                    && !job.cancelled.load(Ordering::SeqCst) =>
            {
                job.committing = true;
                true
            }
            _ => false,
        }
    }

    /// Logs the `export-created` entry. `Ok(None)` means a cancel got in
    /// first and nothing was appended.
    async fn commit(
        &self,
        export_id: &str,
        tenant_id: &str,
        prepared: Prepared,
    ) -> Result<Option<Built>> {
        if !self.begin_commit(export_id) {
            return Ok(None);
        }
        let entry = LogEntry::with_json(
            EntryType::ExportCreated,
            self.clock.now(),
            tenant_id,
            &ExportCreated {
                export_id: export_id.to_string(),
                index_sha256: prepared.index_sha256.clone(),
                records: prepared.records,
                tree_size: prepared.tree_size,
            },
        )?;
        let receipt = self.log.append(entry).await?;

        Ok(Some(Built {
            archive: prepared.archive,
            index_sha256: prepared.index_sha256,
            leaf_index: receipt.leaf_index,
        }))
    }

    /// Gathers one item: the logged record version, the manifest it names,
    /// and a time-stamp token covering it.
    async fn collect(&self, key: EvidenceKey) -> Result<Collected> {
        let object_key = key.record_key();
        let leaf_index = self
            .log
            .find_evidence(&object_key)
            .ok_or_else(|| Error::not_found(format!("log entry for {object_key}")))?;
        let entry = self.log.get_entry(leaf_index)?;
        let pointer: EvidencePointer = entry.payload_json()?;

        let (_, record_bytes) = self
            .store
            .get_version(&pointer.object_key, &pointer.version_id)
            .await?;
        if sha256_hex(&record_bytes) != pointer.record_sha256 {
            return Err(Error::consistency_violation(format!(
                "stored {}@{} does not match leaf {leaf_index}",
                pointer.object_key, pointer.version_id
            )));
        }
        let record: EvidenceRecord = serde_json::from_slice(&record_bytes)?;

        let manifest = match &record.content.manifest_sha256 {
            Some(digest) => Some(self.version_matching(&key.manifest_key(), digest).await?),
            None => None,
        };
        let token = self.covering_token(&key, &record).await?;

        Ok(Collected {
            key,
            leaf_index,
            entry,
            pointer,
            record_bytes,
            record,
            manifest,
            token,
        })
    }

    async fn version_matching(&self, object_key: &str, sha256: &str) -> Result<Vec<u8>> {
        let versions = self.store.versions(object_key).await?;
        let version = versions
            .iter()
            .rev()
            .find(|v| v.sha256 == sha256)
            .ok_or_else(|| Error::not_found(format!("{object_key} with digest {sha256}")))?;
        Ok(self.store.get_version(object_key, &version.version_id).await?.1)
    }

    /// Newest token whose imprint covers the record content.
    async fn covering_token(
        &self,
        key: &EvidenceKey,
        record: &EvidenceRecord,
    ) -> Result<Option<Vec<u8>>> {
        let content = record.content.canonical_bytes()?;
        let tokens = self.store.versions(&key.timestamp_key()).await?;
        for version in tokens.iter().rev() {
            let (_, token) = self
                .store
                .get_version(&version.key, &version.version_id)
                .await?;
            if TstInfo::from_token(&token).is_ok_and(|info| info.covers(&content)) {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown export.
    pub fn status(&self, export_id: &str) -> Result<ExportStatus> {
        self.jobs
            .read()
            .get(export_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| Error::not_found(format!("export {export_id}")))
    }

    /// Every export, newest first.
    pub fn list(&self) -> Vec<ExportStatus> {
        let mut all: Vec<ExportStatus> =
            self.jobs.read().values().map(|j| j.status.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Waits until the export stops building.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown export.
    pub async fn wait(&self, export_id: &str) -> Result<ExportStatus> {
        let task = self
            .jobs
            .write()
            .get_mut(export_id)
            .ok_or_else(|| Error::not_found(format!("export {export_id}")))?
            .task
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(export_id, error = %e, "export task panicked");
                }
            }
        }
        self.status(export_id)
    }

    /// Cancels a building export and discards its partial state. The
    /// background task notices at its next stage boundary.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown export and
    /// `Error::Validation` if it is no longer building or its log entry is
    /// already being written.
    pub fn cancel(&self, export_id: &str) -> Result<ExportStatus> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(export_id)
            .ok_or_else(|| Error::not_found(format!("export {export_id}")))?;
        if job.status.state != ExportState::Building {
            return Err(crate::ValidationError::InvalidState(format!(
                "export {export_id} is {:?}",
                job.status.state
            ))
            .into());
        }
        if job.committing {
            return Err(crate::ValidationError::InvalidState(format!(
                "export {export_id} is already being logged"
            ))
            .into());
        }
        job.cancelled.store(true, Ordering::SeqCst);
        job.archive = None;
        job.status.state = ExportState::Cancelled;
        job.status.finished_at = Some(self.clock.now());
        info!(export_id, "export cancelled");
        Ok(job.status.clone())
    }

    /// The finished archive.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` unless the export is ready.
    pub fn archive(&self, export_id: &str) -> Result<Arc<Vec<u8>>> {
        self.jobs
            .read()
            .get(export_id)
            .and_then(|job| job.archive.clone())
            .ok_or_else(|| Error::not_found(format!("archive of export {export_id}")))
    }

    /// Issues a single-use download token for a ready export.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` unless the export is ready, or
    /// `Error::Validation` for a non-positive `ttl`.
    pub fn issue_download_link(&self, export_id: &str, ttl: Duration) -> Result<DownloadLink> {
        self.archive(export_id)?;
        self.links.issue(export_id, ttl)
    }

    /// Consumes a download token and returns the archive it unlocks.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown, used or expired token.
    pub fn redeem(&self, token: &str) -> Result<(String, Arc<Vec<u8>>)> {
        let export_id = self.links.redeem(token)?;
        let archive = self.archive(&export_id)?;
        Ok((export_id, archive))
    }
}
