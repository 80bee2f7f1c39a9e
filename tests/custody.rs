//! In-process custody scenarios over memory backends and a scripted
//! time-stamp authority.

use chrono::{Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use custodian::clock::{Clock, ManualClock};
use custodian::config::Config;
use custodian::export::{verify_archive, ExportScope, ExportState};
use custodian::hold::{HoldScope, PlaceHold};
use custodian::ingest::TimestampStatus;
use custodian::log::{LogStore, MemoryLogStore};
use custodian::service::{build_state, checkpoint_if_grown, sweep, AppState, Backends};
use custodian::storage::{EvidenceKey, EvidenceSubmission, MemoryObjectStore, ObjectStore};
use custodian::tsa::mock::MockAuthority;
use custodian::tsa::{TsaTransport, TstInfo};

const LOG_SEED: &str = "0101010101010101010101010101010101010101010101010101010101010101";
const EXPORT_SEED: &str = "0202020202020202020202020202020202020202020202020202020202020202";

struct Harness {
    clock: Arc<ManualClock>,
    log_store: Arc<MemoryLogStore>,
    objects: Arc<MemoryObjectStore>,
    tsa: Option<Arc<MockAuthority>>,
    vars: HashMap<&'static str, &'static str>,
}

impl Harness {
    fn new(with_tsa: bool, vars: &[(&'static str, &'static str)]) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
        let mut all: HashMap<&'static str, &'static str> = HashMap::from([
            ("CUSTODIAN_ORIGIN", "custody.test/log"),
            ("CUSTODIAN_SIGNING_KEY", LOG_SEED),
            ("CUSTODIAN_EXPORT_KEY", EXPORT_SEED),
        ]);
        if with_tsa {
            all.insert("CUSTODIAN_TSA_URL", "http://tsa.test/");
            all.insert("CUSTODIAN_TSA_ATTEMPTS", "1");
        }
        all.extend(vars.iter().copied());
        Self {
            objects: Arc::new(MemoryObjectStore::new(clock.clone())),
            tsa: with_tsa.then(|| Arc::new(MockAuthority::new(clock.clone()))),
            log_store: Arc::new(MemoryLogStore::new()),
            clock,
            vars: all,
        }
    }

    /// Builds a fresh service over the same backends, as a restart would.
    async fn start(&self) -> AppState {
        let config = Config::from_lookup(|name| self.vars.get(name).map(|v| (*v).to_string())).unwrap();
        let log: Arc<dyn LogStore> = self.log_store.clone();
        let objects: Arc<dyn ObjectStore> = self.objects.clone();
        let tsa = self.tsa.clone().map(|t| t as Arc<dyn TsaTransport>);
        build_state(
            &config,
            self.clock.clone(),
            Backends {
                log,
                objects,
                escrow: None,
                tsa,
            },
        )
        .await
        .unwrap()
    }
}

fn submission(asset: &str, evidence: &str) -> EvidenceSubmission {
    EvidenceSubmission {
        tenant_id: "acme".into(),
        asset_id: asset.into(),
        evidence_id: evidence.into(),
        manifest_hash: format!("sha256:{evidence}"),
        manifest: Some(format!("c2pa manifest for {asset}/{evidence}").into_bytes()),
        http_headers: BTreeMap::from([
            ("content-type".into(), "image/png".into()),
            ("etag".into(), format!("\"{evidence}\"")),
        ]),
        verification_result: serde_json::json!({"signature": "valid", "chain": ["leaf", "root"]}),
        operator_action: None,
    }
}

fn hold_on_asset(asset: &str, expires_at: chrono::DateTime<Utc>) -> PlaceHold {
    PlaceHold {
        scope: HoldScope::Asset {
            tenant_id: "acme".into(),
            asset_id: asset.into(),
        },
        reason: "litigation LIT-7".into(),
        placed_by: "counsel@acme".into(),
        expires_at: Some(expires_at),
    }
}

#[tokio::test]
async fn ingest_hold_export_and_verify_offline() {
    let harness = Harness::new(true, &[]);
    let state = harness.start().await;

    for evidence in ["e1", "e2"] {
        let receipt = state.ingest.ingest(&submission("a1", evidence), false).await.unwrap();
        assert_eq!(receipt.timestamp, TimestampStatus::Granted);
        assert!(!receipt.legal_hold);
        assert!(receipt.inclusion_proof.verify(&receipt.root_hash));
    }

    let hold = state
        .holds
        .place(hold_on_asset("a1", harness.clock.now() + Duration::days(45)))
        .await
        .unwrap();
    assert!(hold.is_active());

    let later = state.ingest.ingest(&submission("a1", "e3"), false).await.unwrap();
    assert!(later.legal_hold, "writes under an active hold carry the flag");

    let started = state
        .exports
        .build(ExportScope::Asset {
            tenant_id: "acme".into(),
            asset_id: "a1".into(),
        })
        .await
        .unwrap();
    let done = state.exports.wait(&started.export_id).await.unwrap();
    assert_eq!(done.state, ExportState::Ready, "{:?}", done.error);
    assert_eq!(done.records, 3);
    assert_eq!(done.progress, 100);

    let archive = state.exports.archive(&started.export_id).unwrap();
    let export_key = hex::decode(state.exports.public_key_hex()).unwrap();
    let log_key = state.log.public_key();
    let report = verify_archive(&archive, &export_key, Some(&log_key)).unwrap();
    assert!(report.passed(), "{:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.records, 3);

    let mut tampered = archive.to_vec();
    let middle = tampered.len() / 2;
    tampered[middle] ^= 0x01;
    let caught = match verify_archive(&tampered, &export_key, Some(&log_key)) {
        Ok(report) => !report.passed(),
        Err(_) => true,
    };
    assert!(caught, "a flipped byte must not verify");
}

#[tokio::test]
async fn retention_purge_spares_held_evidence_until_the_hold_ends() {
    let harness = Harness::new(false, &[("CUSTODIAN_RETENTION_DAYS", "1")]);
    let state = harness.start().await;

    state.ingest.ingest(&submission("a1", "e1"), false).await.unwrap();
    state.ingest.ingest(&submission("a2", "e1"), false).await.unwrap();
    let hold = state
        .holds
        .place(hold_on_asset("a1", harness.clock.now() + Duration::days(10)))
        .await
        .unwrap();
    let size_before = state.log.size();

    harness.clock.advance(Duration::days(2));
    let first = sweep(&state).await;
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    assert!(first.purge.deleted.iter().any(|d| d.starts_with("evidence/acme/a2/")));
    assert!(first.purge.deleted.iter().all(|d| !d.starts_with("evidence/acme/a1/")));
    assert!(first.purge.held > 0);
    assert_eq!(first.review.within_30_days.len(), 1);

    let a1 = EvidenceKey::new("acme", "a1", "e1").unwrap();
    assert!(state.store.record(&a1).await.is_ok());

    harness.clock.advance(Duration::days(10));
    let second = sweep(&state).await;
    assert_eq!(second.expired_holds, vec![hold.id.clone()]);
    assert!(second.purge.deleted.iter().any(|d| d.starts_with("evidence/acme/a1/")));
    assert!(state.store.record(&a1).await.is_err());

    // Purging storage never rewrites history: only the expiry entry was added.
    assert_eq!(state.log.size(), size_before + 1);
    assert!(state.log.find_evidence(&a1.record_key()).is_some());
}

#[tokio::test]
async fn tsa_outage_is_closed_by_the_sweep() {
    let harness = Harness::new(true, &[]);
    let state = harness.start().await;
    let authority = harness.tsa.clone().unwrap();

    authority.fail_next(1);
    let receipt = state.ingest.ingest(&submission("a1", "e1"), false).await.unwrap();
    assert_eq!(receipt.timestamp, TimestampStatus::Pending);
    assert_eq!(state.ingest.pending(), 1);
    let key = EvidenceKey::new("acme", "a1", "e1").unwrap();
    assert!(state.store.timestamp_token(&key).await.unwrap().is_none());

    let report = sweep(&state).await;
    assert_eq!(report.gaps.stamped, vec![key.record_key()]);
    assert_eq!(report.gaps.pending, 0);

    let token = state.store.timestamp_token(&key).await.unwrap().unwrap();
    let info = TstInfo::from_token(&token).unwrap();
    let content = submission("a1", "e1").content().canonical_bytes().unwrap();
    assert!(info.covers(&content));
    assert_eq!(authority.requests(), 2);
}

#[tokio::test]
async fn restart_rebuilds_log_holds_and_checkpoints() {
    let harness = Harness::new(false, &[]);
    let state = harness.start().await;

    state.ingest.ingest(&submission("a1", "e1"), false).await.unwrap();
    let first = checkpoint_if_grown(&state).await.unwrap().unwrap();
    assert!(checkpoint_if_grown(&state).await.unwrap().is_none(), "no growth, no checkpoint");

    state.ingest.ingest(&submission("a1", "e2"), false).await.unwrap();
    let hold = state
        .holds
        .place(hold_on_asset("a1", harness.clock.now() + Duration::days(30)))
        .await
        .unwrap();
    let second = checkpoint_if_grown(&state).await.unwrap().unwrap();
    assert!(second.tree_size > first.tree_size);
    let (root, size) = (state.log.root(), state.log.size());
    drop(state);

    let restarted = harness.start().await;
    assert_eq!(restarted.log.size(), size);
    assert_eq!(restarted.log.root(), root);
    assert_eq!(restarted.log.checkpoints().len(), 2);
    assert!(restarted.log.verify_consistency(&first, &second).consistent);
    assert_eq!(restarted.holds.get(&hold.id).await.unwrap(), hold);

    let key = EvidenceKey::new("acme", "a1", "e2").unwrap();
    assert!(restarted.holds.covers(&key).await);
    let leaf = restarted.log.find_evidence(&key.record_key()).unwrap();
    let proof = restarted.log.inclusion_proof(leaf).unwrap();
    assert!(proof.verify(&restarted.log.root()));
}

#[tokio::test]
async fn reingesting_identical_content_keeps_the_leaf() {
    let harness = Harness::new(true, &[]);
    let state = harness.start().await;

    let first = state.ingest.ingest(&submission("a1", "e1"), false).await.unwrap();
    let again = state.ingest.ingest(&submission("a1", "e1"), false).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(again.leaf_index, first.leaf_index);
    assert_ne!(again.version_id, first.version_id);
    assert_eq!(state.log.size(), 1);

    let mut changed = submission("a1", "e1");
    changed.operator_action = Some("takedown".into());
    let third = state.ingest.ingest(&changed, false).await.unwrap();
    assert!(!third.duplicate);
    assert_eq!(third.leaf_index, 1);
}
