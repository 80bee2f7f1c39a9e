//! Shared harness for export tests.

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ExportBuilder;
use super::{ExportScope, ExportState};
use crate::clock::ManualClock;
use crate::log::{EntryType, EvidencePointer, LogEntry, MemoryLogStore, TransparencyLog};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::signing::{Ed25519Signer, Signer};
use crate::storage::{
    EvidenceStore, EvidenceStoreConfig, EvidenceSubmission, MemoryObjectStore, StoreOptions,
};
use crate::tsa::mock::MockAuthority;
use crate::tsa::{HashAlgorithm, TsaClient};

const LOG_SEED: [u8; 32] = [1u8; 32];
const EXPORT_SEED: [u8; 32] = [2u8; 32];

pub(crate) struct Fixture {
    pub(crate) store: Arc<EvidenceStore>,
    pub(crate) log: Arc<TransparencyLog>,
    pub(crate) tsa: TsaClient,
    pub(crate) builder: Arc<ExportBuilder>,
}

pub(crate) async fn fixture(max_records: usize) -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
    let store = Arc::new(EvidenceStore::new(
        Arc::new(MemoryObjectStore::new(clock.clone())),
        None,
        clock.clone(),
        RetryExecutor::new(RetryConfig::immediate(1)),
        EvidenceStoreConfig::default(),
    ));
    let log = Arc::new(
        TransparencyLog::open(
            "export.test/log",
            Arc::new(MemoryLogStore::new()),
            Arc::new(Ed25519Signer::from_seed(&LOG_SEED)),
            clock.clone(),
            RetryExecutor::new(RetryConfig::immediate(1)),
        )
        .await
        .unwrap(),
    );
    let tsa = TsaClient::new(
        Arc::new(MockAuthority::new(clock.clone())),
        HashAlgorithm::Sha256,
        None,
        RetryExecutor::new(RetryConfig::immediate(1)),
    );
    let builder = Arc::new(ExportBuilder::new(
        store.clone(),
        log.clone(),
        Arc::new(Ed25519Signer::from_seed(&EXPORT_SEED)),
        clock,
        max_records,
    ));
    Fixture {
        store,
        log,
        tsa,
        builder,
    }
}

pub(crate) fn submission(asset: &str, evidence: &str, action: Option<&str>) -> EvidenceSubmission {
    EvidenceSubmission {
        tenant_id: "acme".into(),
        asset_id: asset.into(),
        evidence_id: evidence.into(),
        manifest_hash: "c0ffee".into(),
        manifest: Some(format!("manifest of {evidence}").into_bytes()),
        http_headers: BTreeMap::from([("content-type".into(), "image/jpeg".into())]),
        verification_result: serde_json::json!({"valid": true}),
        operator_action: action.map(str::to_string),
    }
}

/// Stores, logs and stamps one item the way ingestion does.
pub(crate) async fn custody(f: &Fixture, submission: &EvidenceSubmission) -> u64 {
    let receipt = f.store.store(submission, StoreOptions::default()).await.unwrap();
    let pointer = EvidencePointer {
        object_key: receipt.object_key,
        version_id: receipt.version_id,
        content_hash: receipt.content_hash,
        record_sha256: receipt.record_sha256,
        retention_until: receipt.retention_until,
    };
    let entry = LogEntry::with_json(EntryType::EvidenceStored, Utc::now(), "acme", &pointer).unwrap();
    let leaf = f.log.append_evidence(entry).await.unwrap().leaf_index;
    let content = submission.content().canonical_bytes().unwrap();
    let stamp = f.tsa.timestamp(&content).await.unwrap();
    f.store
        .attach_timestamp(&submission.key().unwrap(), &stamp.token)
        .await
        .unwrap();
    leaf
}

pub(crate) struct SampleExport {
    pub(crate) archive: Vec<u8>,
    pub(crate) export_key: Vec<u8>,
    pub(crate) log_key: Vec<u8>,
}

/// A ready two-record export of asset `a1`.
pub(crate) async fn sample_export() -> SampleExport {
    let f = fixture(super::DEFAULT_MAX_RECORDS).await;
    custody(&f, &submission("a1", "e1", None)).await;
    custody(&f, &submission("a1", "e2", Some("flagged"))).await;
    let started = f
        .builder
        .build(ExportScope::Asset {
            tenant_id: "acme".into(),
            asset_id: "a1".into(),
        })
        .await
        .unwrap();
    let done = f.builder.wait(&started.export_id).await.unwrap();
    assert_eq!(done.state, ExportState::Ready, "{:?}", done.error);
    SampleExport {
        archive: f.builder.archive(&started.export_id).unwrap().to_vec(),
        export_key: Ed25519Signer::from_seed(&EXPORT_SEED).public_key(),
        log_key: f.log.public_key(),
    }
}
