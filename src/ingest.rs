//! Producer-facing ingestion: store, log, then time-stamp.
//!
//! A time-stamp failure never fails an ingest. The item is queued and the
//! gap-closing sweep stamps it later.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::Result;
use crate::hold::LegalHoldManager;
use crate::log::{EntryType, EvidencePointer, LogEntry, TransparencyLog};
use crate::storage::{EvidenceKey, EvidenceStore, EvidenceSubmission, StoreOptions};
use crate::tsa::{TsaClient, TstInfo};
use crate::{Hash, InclusionProof};

/// Where an item's time-stamp stands after ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStatus {
    /// A token covering the content is stored
    Granted,
    /// Queued for the gap-closing sweep
    Pending,
    /// No authority is configured
    Disabled,
}

/// What a producer gets back from an ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Key of `record.json`
    pub object_key: String,
    /// Storage version written by this call
    pub version_id: String,
    /// Hex SHA-256 over the canonical content
    pub content_hash: String,
    /// Retention applied to the write
    pub retention_until: DateTime<Utc>,
    /// Whether the write is under legal hold
    pub legal_hold: bool,
    /// Leaf that logs this content
    pub leaf_index: u64,
    /// Tree size the proof refers to
    pub tree_size: u64,
    /// Root at `tree_size`
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// Proof of `leaf_index`
    pub inclusion_proof: InclusionProof,
    /// True when identical content was already logged
    pub duplicate: bool,
    /// Time-stamp state
    pub timestamp: TimestampStatus,
    /// Time asserted by the authority, when granted
    pub timestamp_time: Option<DateTime<Utc>>,
}

/// Outcome of a gap-closing sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    /// Items stamped by this sweep
    pub stamped: Vec<String>,
    /// Items still without a token
    pub pending: usize,
}

/// Coordinates the evidence store, the log and the time-stamp authority.
pub struct IngestPipeline {
    store: Arc<EvidenceStore>,
    log: Arc<TransparencyLog>,
    tsa: Option<TsaClient>,
    holds: Option<Arc<LegalHoldManager>>,
    clock: SharedClock,
    gaps: Mutex<BTreeSet<EvidenceKey>>,
}

impl IngestPipeline {
    /// Creates a pipeline. Without `tsa` every item is logged unstamped.
    pub fn new(
        store: Arc<EvidenceStore>,
        log: Arc<TransparencyLog>,
        tsa: Option<TsaClient>,
        holds: Option<Arc<LegalHoldManager>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            log,
            tsa,
            holds,
            clock,
            gaps: Mutex::new(BTreeSet::new()),
        }
    }

    /// Items waiting for a time-stamp.
    pub fn pending(&self) -> usize {
        self.gaps.lock().len()
    }

    /// Stores, logs and time-stamps one submission.
    ///
    /// The write carries a legal hold when `legal_hold` is set or an active
    /// hold already covers the item. Identical content for the same ids
    /// keeps its original leaf; the new storage version is still written.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` before any write, or the store or log
    /// failure that aborted the ingest. Time-stamp failures are not errors.
    pub async fn ingest(
        &self,
        submission: &EvidenceSubmission,
        legal_hold: bool,
    ) -> Result<IngestReceipt> {
        let key = self.store.validate(submission)?;
        // Holds cannot be placed while the write is in flight, so a new
        // hold either shows up here or finds the stored version.
        let coverage = match &self.holds {
            Some(holds) if !legal_hold => Some(holds.coverage().await),
            _ => None,
        };
        let held = legal_hold || coverage.as_ref().is_some_and(|c| c.covers(&key));

        let stored = self
            .store
            .store(submission, StoreOptions { legal_hold: held })
            .await;
        drop(coverage);
        let stored = stored?;
        let pointer = EvidencePointer {
            object_key: stored.object_key.clone(),
            version_id: stored.version_id.clone(),
            content_hash: stored.content_hash.clone(),
            record_sha256: stored.record_sha256.clone(),
            retention_until: stored.retention_until,
        };
        let entry = LogEntry::with_json(
            EntryType::EvidenceStored,
            self.clock.now(),
            key.tenant_id.as_str(),
            &pointer,
        )?;
        let appended = self.log.append_evidence(entry).await?;

        let content = submission.content().canonical_bytes()?;
        let (timestamp, timestamp_time) = self.stamp(&key, &content, appended.duplicate).await;

        info!(
            object_key = %stored.object_key,
            leaf_index = appended.leaf_index,
            duplicate = appended.duplicate,
            timestamp = ?timestamp,
            "evidence ingested"
        );
        Ok(IngestReceipt {
            object_key: stored.object_key,
            version_id: stored.version_id,
            content_hash: stored.content_hash,
            retention_until: stored.retention_until,
            legal_hold: held,
            leaf_index: appended.leaf_index,
            tree_size: appended.tree_size,
            root_hash: appended.root_hash,
            inclusion_proof: appended.inclusion_proof,
            duplicate: appended.duplicate,
            timestamp,
            timestamp_time,
        })
    }

    async fn stamp(
        &self,
        key: &EvidenceKey,
        content: &[u8],
        duplicate: bool,
    ) -> (TimestampStatus, Option<DateTime<Utc>>) {
        if duplicate {
            if let Ok(Some(token)) = self.store.timestamp_token(key).await {
                if let Ok(info) = TstInfo::from_token(&token) {
                    if info.covers(content) {
                        return (TimestampStatus::Granted, Some(info.gen_time));
                    }
                }
            }
        }
        let Some(tsa) = &self.tsa else {
            return (TimestampStatus::Disabled, None);
        };

        let attached = match tsa.timestamp(content).await {
            Ok(stamp) => self
                .store
                .attach_timestamp(key, &stamp.token)
                .await
                .map(|_| stamp.gen_time),
            Err(e) => Err(e),
        };
        match attached {
            Ok(gen_time) => {
                self.gaps.lock().remove(key);
                (TimestampStatus::Granted, Some(gen_time))
            }
            Err(e) => {
                warn!(
                    object_key = %key.record_key(),
                    error = %e,
                    "time-stamp deferred to the gap-closing sweep"
                );
                self.gaps.lock().insert(key.clone());
                (TimestampStatus::Pending, None)
            }
        }
    }

    /// Stamps every queued item and every stored item that has no token.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the store cannot be listed. Per-item
    /// failures leave the item queued.
    pub async fn close_gaps(&self) -> Result<GapReport> {
        let mut candidates: BTreeSet<EvidenceKey> = self.gaps.lock().clone();
        candidates.extend(self.store.missing_timestamps().await?);

        let mut report = GapReport::default();
        let Some(tsa) = &self.tsa else {
            report.pending = candidates.len();
            return Ok(report);
        };

        for key in candidates {
            let stamped = async {
                let record = self.store.record(&key).await?;
                let stamp = tsa.timestamp(&record.content.canonical_bytes()?).await?;
                self.store.attach_timestamp(&key, &stamp.token).await
            }
            .await;
            match stamped {
                Ok(_) => {
                    self.gaps.lock().remove(&key);
                    report.stamped.push(key.record_key());
                }
                Err(e) => {
                    warn!(object_key = %key.record_key(), error = %e, "gap still open");
                    self.gaps.lock().insert(key);
                }
            }
        }
        report.pending = self.pending();
        info!(
            stamped = report.stamped.len(),
            pending = report.pending,
            "gap-closing sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hold::{HoldScope, PlaceHold};
    use crate::log::MemoryLogStore;
    use crate::retry::{RetryConfig, RetryExecutor};
    use crate::signing::Ed25519Signer;
    use crate::storage::{EvidenceStoreConfig, MemoryObjectStore};
    use crate::tsa::mock::MockAuthority;
    use crate::tsa::HashAlgorithm;
    use crate::ErrorKind;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    struct Fixture {
        clock: Arc<ManualClock>,
        objects: Arc<MemoryObjectStore>,
        authority: Arc<MockAuthority>,
        store: Arc<EvidenceStore>,
        log: Arc<TransparencyLog>,
        holds: Arc<LegalHoldManager>,
        pipeline: IngestPipeline,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap()));
        let objects = Arc::new(MemoryObjectStore::new(clock.clone()));
        let store = Arc::new(EvidenceStore::new(
            objects.clone(),
            None,
            clock.clone(),
            RetryExecutor::new(RetryConfig::immediate(2)),
            EvidenceStoreConfig::default(),
        ));
        let log = Arc::new(
            TransparencyLog::open(
                "ingest.test/log",
                Arc::new(MemoryLogStore::new()),
                Arc::new(Ed25519Signer::from_seed(&[5u8; 32])),
                clock.clone(),
                RetryExecutor::new(RetryConfig::immediate(2)),
            )
            .await
            .unwrap(),
        );
        let authority = Arc::new(MockAuthority::new(clock.clone()));
        let tsa = TsaClient::new(
            authority.clone(),
            HashAlgorithm::Sha256,
            None,
            RetryExecutor::new(RetryConfig::immediate(2)),
        );
        let holds = Arc::new(LegalHoldManager::open(store.clone(), log.clone(), clock.clone()).unwrap());
        let pipeline = IngestPipeline::new(
            store.clone(),
            log.clone(),
            Some(tsa),
            Some(holds.clone()),
            clock.clone(),
        );
        Fixture {
            clock,
            objects,
            authority,
            store,
            log,
            holds,
            pipeline,
        }
    }

    fn submission(evidence: &str) -> EvidenceSubmission {
        EvidenceSubmission {
            tenant_id: "acme".into(),
            asset_id: "asset-7".into(),
            evidence_id: evidence.into(),
            manifest_hash: "abcdef01".into(),
            manifest: Some(vec![0xC2, 0xFA, 0x00, 0x01]),
            http_headers: BTreeMap::from([("etag".into(), "\"v1\"".into())]),
            verification_result: serde_json::json!({"valid": true, "issuer": "CN=Test"}),
            operator_action: None,
        }
    }

    #[tokio::test]
    async fn ingest_stores_logs_and_stamps() {
        let f = fixture().await;
        let receipt = f.pipeline.ingest(&submission("ev-1"), false).await.unwrap();

        assert_eq!(receipt.leaf_index, 0);
        assert!(receipt.inclusion_proof.verify(&f.log.root()));
        assert_eq!(receipt.timestamp, TimestampStatus::Granted);
        assert_eq!(receipt.timestamp_time, Some(f.clock.now()));
        assert!(!receipt.legal_hold);

        let key = submission("ev-1").key().unwrap();
        let token = f.store.timestamp_token(&key).await.unwrap().unwrap();
        let content = submission("ev-1").content().canonical_bytes().unwrap();
        assert!(TstInfo::from_token(&token).unwrap().covers(&content));
        assert_eq!(f.log.find_evidence(&receipt.object_key), Some(0));
    }

    #[tokio::test]
    async fn invalid_submissions_write_nothing() {
        let f = fixture().await;
        let mut bad = submission("ev-1");
        bad.asset_id = "../etc".into();
        let err = f.pipeline.ingest(&bad, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.objects.version_count(), 0);
        assert_eq!(f.log.size(), 0);
        assert_eq!(f.authority.requests(), 0);
    }

    #[tokio::test]
    async fn authority_outage_defers_the_stamp() {
        let f = fixture().await;
        f.authority.fail_next(2);
        let receipt = f.pipeline.ingest(&submission("ev-1"), false).await.unwrap();
        assert_eq!(receipt.timestamp, TimestampStatus::Pending);
        assert_eq!(f.log.size(), 1);
        assert_eq!(f.pipeline.pending(), 1);

        let report = f.pipeline.close_gaps().await.unwrap();
        assert_eq!(report.stamped, vec![receipt.object_key]);
        assert_eq!(report.pending, 0);
        assert!(f.store.missing_timestamps().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_content_keeps_its_leaf() {
        let f = fixture().await;
        let first = f.pipeline.ingest(&submission("ev-1"), false).await.unwrap();
        let second = f.pipeline.ingest(&submission("ev-1"), false).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.leaf_index, first.leaf_index);
        assert_ne!(second.version_id, first.version_id);
        assert_eq!(second.timestamp, TimestampStatus::Granted);
        assert_eq!(f.log.size(), 1);
        assert_eq!(f.authority.requests(), 1);
        assert_eq!(f.store.versions(&first.object_key).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn holds_placed_during_ingest_cover_the_write() {
        let f = fixture().await;
        let pipeline = Arc::new(f.pipeline);
        for round in 0..25 {
            let asset = format!("asset-{round}");
            let mut evidence = submission("ev-1");
            evidence.asset_id = asset.clone();
            let key = evidence.key().unwrap();

            let ingest = {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.ingest(&evidence, false).await })
            };
            let place = {
                let holds = f.holds.clone();
                let expires_at = Some(f.clock.now() + Duration::days(30));
                tokio::spawn(async move {
                    holds
                        .place(PlaceHold {
                            scope: HoldScope::Asset {
                                tenant_id: "acme".into(),
                                asset_id: asset,
                            },
                            reason: "subpoena".into(),
                            placed_by: "legal@acme".into(),
                            expires_at,
                        })
                        .await
                })
            };
            ingest.await.unwrap().unwrap();
            place.await.unwrap().unwrap();

            for version in f.store.versions(&key.record_key()).await.unwrap() {
                assert!(version.legal_hold, "round {round}: {} left unheld", version.version_id);
            }
        }
    }

    #[tokio::test]
    async fn active_holds_apply_to_new_writes() {
        let f = fixture().await;
        f.pipeline.ingest(&submission("ev-1"), false).await.unwrap();
        f.holds
            .place(PlaceHold {
                scope: HoldScope::Asset {
                    tenant_id: "acme".into(),
                    asset_id: "asset-7".into(),
                },
                reason: "subpoena".into(),
                placed_by: "legal@acme".into(),
                expires_at: Some(f.clock.now() + Duration::days(30)),
            })
            .await
            .unwrap();

        let later = f.pipeline.ingest(&submission("ev-2"), false).await.unwrap();
        assert!(later.legal_hold);
        assert!(f.store.head(&later.object_key).await.unwrap().legal_hold);

        let explicit = f.pipeline.ingest(&submission("ev-3"), true).await.unwrap();
        assert!(explicit.legal_hold);
    }

    #[tokio::test]
    async fn without_an_authority_stamps_are_disabled() {
        let f = fixture().await;
        let pipeline = IngestPipeline::new(f.store.clone(), f.log.clone(), None, None, f.clock.clone());
        let receipt = pipeline.ingest(&submission("ev-1"), false).await.unwrap();
        assert_eq!(receipt.timestamp, TimestampStatus::Disabled);
        let report = pipeline.close_gaps().await.unwrap();
        assert!(report.stamped.is_empty());
        assert_eq!(report.pending, 1);
    }
}
