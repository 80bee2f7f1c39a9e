use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::state::MerkleState;
use super::store::LogStore;
use super::{Checkpoint, EntryType, EvidencePointer, LogEntry};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::retry::RetryExecutor;
use crate::signing::Signer;
use crate::{ConsistencyProof, Hash, InclusionProof};

/// What a caller gets back from a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    /// Leaf index of the entry
    pub leaf_index: u64,
    /// Leaf hash of the entry
    #[serde(with = "crate::hash_format")]
    pub entry_hash: Hash,
    /// Tree size the proof was generated against
    pub tree_size: u64,
    /// Root at `tree_size`
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// Proof of `leaf_index` in the tree of `tree_size`
    pub inclusion_proof: InclusionProof,
    /// True when the entry was already logged and nothing was appended
    pub duplicate: bool,
}

/// Outcome of comparing two checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Whether the newer checkpoint extends the older one
    pub consistent: bool,
    /// The proof that was checked, when one could be produced
    pub proof: Option<ConsistencyProof>,
    /// Why the pair is inconsistent
    pub reason: Option<String>,
}

impl ConsistencyReport {
    fn inconsistent(reason: String, proof: Option<ConsistencyProof>) -> Self {
        tracing::error!(%reason, "checkpoint pair is inconsistent");
        Self {
            consistent: false,
            proof,
            reason: Some(reason),
        }
    }
}

/// An append-only transparency log: a Merkle tree over durably stored
/// entries, with signed checkpoints.
///
/// Appends are serialized through a single writer lock; leaf order is append
/// order. Proofs are generated under a read lock, so each one reflects a
/// single tree size even while appends continue.
pub struct TransparencyLog {
    origin: String,
    state: Arc<RwLock<MerkleState>>,
    writer: Mutex<()>,
    appended: AtomicU64,
    store: Arc<dyn LogStore>,
    signer: Arc<dyn Signer>,
    clock: SharedClock,
    retry: RetryExecutor,
}

impl TransparencyLog {
    /// Opens the log for `origin`, replaying everything the store holds.
    ///
    /// Every stored leaf hash is recomputed from its entry, indexes must be
    /// gapless, and every stored checkpoint must match the rebuilt tree.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if the stored history does not
    /// rebuild cleanly, or `Error::Storage` if it cannot be read.
    pub async fn open(
        origin: impl Into<String>,
        store: Arc<dyn LogStore>,
        signer: Arc<dyn Signer>,
        clock: SharedClock,
        retry: RetryExecutor,
    ) -> Result<Self> {
        let origin = origin.into();
        let stored = retry
            .execute("load log entries", || store.load_entries(&origin))
            .await?;
        let checkpoints = retry
            .execute("load checkpoints", || store.load_checkpoints(&origin))
            .await?;

        let mut state = MerkleState::new();
        for (expected, item) in stored.into_iter().enumerate() {
            if item.index != expected as u64 {
                return Err(Error::consistency_violation(format!(
                    "log '{origin}' has a gap: expected index {expected}, found {}",
                    item.index
                )));
            }
            let recomputed = item.entry.leaf_hash()?;
            if recomputed != item.leaf_hash {
                return Err(Error::consistency_violation(format!(
                    "entry {} of '{origin}' does not match its recorded leaf hash",
                    item.index
                )));
            }
            if item.entry.entry_type == EntryType::EvidenceStored {
                let pointer: EvidencePointer = item.entry.payload_json()?;
                state.index_evidence(&pointer.object_key, &pointer.content_hash, item.index);
            }
            state.push(item.entry, recomputed);
        }

        for checkpoint in &checkpoints {
            let root = state.tree.root_at(checkpoint.tree_size).map_err(|_| {
                Error::consistency_violation(format!(
                    "checkpoint at size {} is beyond the {} stored entries of '{origin}'",
                    checkpoint.tree_size,
                    state.size()
                ))
            })?;
            if root != checkpoint.root_hash {
                return Err(Error::consistency_violation(format!(
                    "rebuilt root at size {} disagrees with the signed checkpoint",
                    checkpoint.tree_size
                )));
            }
        }
        state.checkpoints = checkpoints;

        tracing::info!(
            origin = %origin,
            tree_size = state.size(),
            checkpoints = state.checkpoints.len(),
            "transparency log rebuilt"
        );

        Ok(Self {
            origin,
            state: Arc::new(RwLock::new(state)),
            writer: Mutex::new(()),
            appended: AtomicU64::new(0),
            store,
            signer,
            clock,
            retry,
        })
    }

    /// Log origin identifier.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Public key checkpoints are signed with.
    pub fn public_key(&self) -> Vec<u8> {
        self.signer.public_key()
    }

    /// Current number of leaves.
    pub fn size(&self) -> u64 {
        self.state.read().size()
    }

    /// Entries this process appended since the log was opened. Duplicate
    /// evidence that reused a leaf is not counted.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Current root hash.
    pub fn root(&self) -> Hash {
        self.state.read().tree.root()
    }

    /// Root hash of the first `size` leaves.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `size` exceeds the log.
    pub fn root_at(&self, size: u64) -> Result<Hash> {
        Ok(self.state.read().tree.root_at(size)?)
    }

    /// Appends an entry once it is durable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the entry could not be persisted after
    /// retries, or `Error::ConsistencyViolation` if the store disagrees about
    /// what lives at the next index. Nothing becomes visible on error.
    pub async fn append(&self, entry: LogEntry) -> Result<AppendReceipt> {
        let _writer = self.writer.lock().await;
        self.append_locked(entry, None).await
    }

    /// Appends an `evidence-stored` entry unless the same content was already
    /// logged for the same object, in which case the original leaf is returned
    /// with `duplicate` set.
    ///
    /// # Errors
    ///
    /// See [`TransparencyLog::append`]. Returns `Error::Validation` if
    /// `entry` is not an `evidence-stored` entry.
    pub async fn append_evidence(&self, entry: LogEntry) -> Result<AppendReceipt> {
        if entry.entry_type != EntryType::EvidenceStored {
            return Err(Error::invalid(format!(
                "expected an evidence-stored entry, got {}",
                entry.entry_type
            )));
        }
        let pointer: EvidencePointer = entry.payload_json()?;

        let _writer = self.writer.lock().await;
        let existing = self
            .state
            .read()
            .evidence_leaf(&pointer.object_key, &pointer.content_hash);
        if let Some(index) = existing {
            tracing::info!(
                object_key = %pointer.object_key,
                leaf_index = index,
                "evidence already logged"
            );
            let state = self.state.read();
            return receipt(&state, index, true);
        }

        self.append_locked(entry, Some(pointer)).await
    }

    /// Caller must hold `self.writer`.
    async fn append_locked(
        &self,
        entry: LogEntry,
        pointer: Option<EvidencePointer>,
    ) -> Result<AppendReceipt> {
        let leaf_hash = entry.leaf_hash()?;
        let index = self.size();

        let store = &self.store;
        let origin = self.origin.as_str();
        let entry_ref = &entry;
        let hash_ref = &leaf_hash;
        self.retry
            .execute("log append", move || {
                store.append_entry(origin, index, entry_ref, hash_ref)
            })
            .await?;

        let mut state = self.state.write();
        let entry_type = entry.entry_type;
        let pushed = state.push(entry, leaf_hash);
        if let Some(pointer) = pointer {
            state.index_evidence(&pointer.object_key, &pointer.content_hash, pushed);
        }
        let receipt = receipt(&state, pushed, false)?;
        drop(state);
        self.appended.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            origin = %self.origin,
            leaf_index = pushed,
            entry_type = %entry_type,
            tree_size = receipt.tree_size,
            "entry appended"
        );
        Ok(receipt)
    }

    /// Signs and persists a checkpoint of the current tree.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the checkpoint could not be persisted.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let _writer = self.writer.lock().await;
        let (size, root) = {
            let state = self.state.read();
            (state.size(), state.tree.root())
        };
        let checkpoint = Checkpoint::sign(
            &self.origin,
            size,
            root,
            self.clock.now(),
            self.signer.as_ref(),
        );

        let store = &self.store;
        let cp = &checkpoint;
        self.retry
            .execute("save checkpoint", move || store.save_checkpoint(cp))
            .await?;
        self.state.write().checkpoints.push(checkpoint.clone());

        tracing::info!(origin = %self.origin, tree_size = size, "checkpoint signed");
        Ok(checkpoint)
    }

    /// The most recent checkpoint, if any was issued.
    pub fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.state.read().checkpoints.last().cloned()
    }

    /// Every checkpoint, oldest first.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.state.read().checkpoints.clone()
    }

    /// Checks a checkpoint's signature against `public_key`.
    pub fn verify_checkpoint_signature(checkpoint: &Checkpoint, public_key: &[u8]) -> bool {
        checkpoint.verify_signature(public_key)
    }

    /// Decides whether `new` is an append-only extension of `old`.
    ///
    /// Never fails on a bad pair: an older checkpoint larger than the newer
    /// one, a foreign origin, a bad signature, or a root that does not match
    /// this log are all reported as inconsistent.
    pub fn verify_consistency(&self, old: &Checkpoint, new: &Checkpoint) -> ConsistencyReport {
        for cp in [old, new] {
            if cp.origin != self.origin {
                return ConsistencyReport::inconsistent(
                    format!("checkpoint belongs to '{}', not '{}'", cp.origin, self.origin),
                    None,
                );
            }
        }
        if old.tree_size > new.tree_size {
            return ConsistencyReport::inconsistent(
                format!(
                    "old size {} exceeds new size {}",
                    old.tree_size, new.tree_size
                ),
                None,
            );
        }
        let key = self.public_key();
        for (label, cp) in [("old", old), ("new", new)] {
            if !cp.verify_signature(&key) {
                return ConsistencyReport::inconsistent(
                    format!("{label} checkpoint signature does not verify"),
                    None,
                );
            }
        }

        let state = self.state.read();
        let proof = match state.tree.consistency_proof(old.tree_size, new.tree_size) {
            Ok(proof) => proof,
            Err(e) => return ConsistencyReport::inconsistent(e.to_string(), None),
        };
        for (label, cp) in [("old", old), ("new", new)] {
            match state.tree.root_at(cp.tree_size) {
                Ok(root) if root == cp.root_hash => {}
                _ => {
                    return ConsistencyReport::inconsistent(
                        format!("{label} checkpoint root does not match this log"),
                        Some(proof),
                    )
                }
            }
        }
        drop(state);

        if proof.verify(&old.root_hash, &new.root_hash) {
            ConsistencyReport {
                consistent: true,
                proof: Some(proof),
                reason: None,
            }
        } else {
            ConsistencyReport::inconsistent("consistency proof does not verify".into(), Some(proof))
        }
    }

    /// Entry at `index`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown index.
    pub fn get_entry(&self, index: u64) -> Result<LogEntry> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.state.read().entries.get(i).cloned())
            .ok_or_else(|| Error::not_found(format!("leaf {index} in '{}'", self.origin)))
    }

    /// Every entry of one type, with its leaf index.
    pub fn entries_of_type(&self, entry_type: EntryType) -> Vec<(u64, LogEntry)> {
        self.state
            .read()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.entry_type == entry_type)
            .map(|(i, e)| (i as u64, e.clone()))
            .collect()
    }

    /// Latest leaf that logged `object_key`.
    pub fn find_evidence(&self, object_key: &str) -> Option<u64> {
        self.state.read().latest_evidence_leaf(object_key)
    }

    /// Inclusion proof for `index` against the current tree.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown index.
    pub fn inclusion_proof(&self, index: u64) -> Result<InclusionProof> {
        Ok(self.state.read().tree.inclusion_proof(index)?)
    }

    /// Inclusion proof for `index` against the tree of `tree_size` leaves.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `index` or `tree_size` is out of range.
    pub fn inclusion_proof_at(&self, index: u64, tree_size: u64) -> Result<InclusionProof> {
        Ok(self.state.read().tree.inclusion_proof_at(index, tree_size)?)
    }

    /// Consistency proof between two sizes.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if `old_size > new_size`, `Error::NotFound`
    /// if `new_size` exceeds the log.
    pub fn consistency_proof(&self, old_size: u64, new_size: u64) -> Result<ConsistencyProof> {
        Ok(self.state.read().tree.consistency_proof(old_size, new_size)?)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_leaf(&self, index: u64, hash: Hash) {
        self.state.write().tree.corrupt_leaf(index, hash);
    }
}

fn receipt(state: &MerkleState, index: u64, duplicate: bool) -> Result<AppendReceipt> {
    let inclusion_proof = state.tree.inclusion_proof(index)?;
    Ok(AppendReceipt {
        leaf_index: index,
        entry_hash: inclusion_proof.leaf_hash,
        tree_size: inclusion_proof.tree_size,
        root_hash: state.tree.root(),
        inclusion_proof,
        duplicate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::log::MemoryLogStore;
    use crate::retry::RetryConfig;
    use crate::signing::Ed25519Signer;
    use chrono::{Duration, TimeZone, Utc};

    const ORIGIN: &str = "test.local/log";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
        ))
    }

    async fn open_with(store: Arc<MemoryLogStore>, clock: Arc<ManualClock>) -> Result<TransparencyLog> {
        TransparencyLog::open(
            ORIGIN,
            store,
            Arc::new(Ed25519Signer::from_seed(&[9u8; 32])),
            clock as SharedClock,
            RetryExecutor::new(RetryConfig::immediate(3)),
        )
        .await
    }

    fn entry(data: &str) -> LogEntry {
        LogEntry::new(
            EntryType::HoldPlaced,
            Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
            "acme",
            data.as_bytes().to_vec(),
        )
        .unwrap()
    }

    fn evidence_entry(key: &str, content_hash: &str, version: &str) -> LogEntry {
        let pointer = EvidencePointer {
            object_key: key.into(),
            version_id: version.into(),
            content_hash: content_hash.into(),
            record_sha256: "00".into(),
            retention_until: Utc.with_ymd_and_hms(2027, 5, 1, 0, 0, 0).unwrap(),
        };
        LogEntry::with_json(EntryType::EvidenceStored, Utc::now(), "acme", &pointer).unwrap()
    }

    #[tokio::test]
    async fn append_returns_verifiable_receipt() {
        let log = open_with(Arc::new(MemoryLogStore::new()), clock()).await.unwrap();
        for (i, data) in ["a", "b", "c"].iter().enumerate() {
            let receipt = log.append(entry(data)).await.unwrap();
            assert_eq!(receipt.leaf_index, i as u64);
            assert_eq!(receipt.tree_size, i as u64 + 1);
            assert!(receipt.inclusion_proof.verify(&receipt.root_hash));
            assert!(!receipt.duplicate);
        }
        assert_eq!(log.get_entry(1).unwrap(), entry("b"));
        assert!(matches!(log.get_entry(3), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_persist_is_not_visible() {
        let store = Arc::new(MemoryLogStore::new());
        let log = open_with(store.clone(), clock()).await.unwrap();
        store.fail_next_appends(5);
        let err = log.append(entry("a")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(log.size(), 0);
        assert_eq!(log.appended(), 0);
        assert!(store.is_empty(ORIGIN));

        // a transient failure within the retry budget is absorbed
        store.fail_next_appends(2);
        log.append(entry("a")).await.unwrap();
        assert_eq!(log.size(), 1);
    }

    #[tokio::test]
    async fn evidence_dedup_returns_original_leaf() {
        let log = open_with(Arc::new(MemoryLogStore::new()), clock()).await.unwrap();
        let first = log.append_evidence(evidence_entry("k", "aa", "v1")).await.unwrap();
        log.append(entry("x")).await.unwrap();
        let again = log.append_evidence(evidence_entry("k", "aa", "v2")).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.leaf_index, first.leaf_index);
        assert_eq!(log.size(), 2);
        assert_eq!(log.appended(), 2);

        let changed = log.append_evidence(evidence_entry("k", "bb", "v3")).await.unwrap();
        assert!(!changed.duplicate);
        assert_eq!(log.find_evidence("k"), Some(changed.leaf_index));
        assert!(log.append_evidence(entry("not evidence")).await.is_err());
    }

    #[tokio::test]
    async fn checkpoints_chain_consistently() {
        let clock = clock();
        let log = open_with(Arc::new(MemoryLogStore::new()), clock.clone()).await.unwrap();
        for data in ["a", "b", "c"] {
            log.append(entry(data)).await.unwrap();
        }
        let old = log.checkpoint().await.unwrap();
        clock.advance(Duration::minutes(5));
        for data in ["d", "e"] {
            log.append(entry(data)).await.unwrap();
        }
        let new = log.checkpoint().await.unwrap();
        assert_eq!(log.latest_checkpoint(), Some(new.clone()));
        assert_eq!(log.checkpoints().len(), 2);

        let report = log.verify_consistency(&old, &new);
        assert!(report.consistent, "{:?}", report.reason);
        assert_eq!(report.proof.unwrap().old_size, 3);

        let reversed = log.verify_consistency(&new, &old);
        assert!(!reversed.consistent);
        assert!(reversed.proof.is_none());

        let mut forged = new.clone();
        forged.root_hash = [0u8; 32];
        assert!(!log.verify_consistency(&old, &forged).consistent);

        let other = Ed25519Signer::from_seed(&[1u8; 32]);
        let resigned = Checkpoint::sign(ORIGIN, new.tree_size, new.root_hash, new.timestamp, &other);
        let report = log.verify_consistency(&old, &resigned);
        assert!(!report.consistent);
        assert!(report.reason.unwrap().contains("signature"));
    }

    #[tokio::test]
    async fn reopen_rebuilds_identical_tree() {
        let store = Arc::new(MemoryLogStore::new());
        let clock = clock();
        let log = open_with(store.clone(), clock.clone()).await.unwrap();
        log.append_evidence(evidence_entry("k", "aa", "v1")).await.unwrap();
        log.append(entry("b")).await.unwrap();
        let cp = log.checkpoint().await.unwrap();
        let root = log.root();

        let reopened = open_with(store, clock).await.unwrap();
        assert_eq!(reopened.root(), root);
        assert_eq!(reopened.latest_checkpoint(), Some(cp));
        assert_eq!(reopened.find_evidence("k"), Some(0));
    }

    #[tokio::test]
    async fn tampered_store_refuses_to_open() {
        let store = Arc::new(MemoryLogStore::new());
        let log = open_with(store.clone(), clock()).await.unwrap();
        log.append(entry("a")).await.unwrap();
        log.append(entry("b")).await.unwrap();

        store.tamper(ORIGIN, 1, entry("B"));
        assert!(matches!(
            open_with(store, clock()).await,
            Err(Error::ConsistencyViolation(_))
        ));
    }

    #[tokio::test]
    async fn five_leaf_scenario() {
        let log = open_with(Arc::new(MemoryLogStore::new()), clock()).await.unwrap();
        let mut roots = Vec::new();
        for data in ["a", "b", "c", "d", "e"] {
            roots.push(log.append(entry(data)).await.unwrap().root_hash);
        }
        assert_ne!(roots[3], roots[2]);
        let proof = log.consistency_proof(3, 5).unwrap();
        assert!(proof.verify(&roots[2], &roots[4]));
        assert!(matches!(
            log.consistency_proof(5, 3),
            Err(Error::ConsistencyViolation(_))
        ));

        let root = log.root();
        log.corrupt_leaf(1, [0xEE; 32]);
        let proof = log.inclusion_proof(1).unwrap();
        assert!(!proof.verify(&root));
    }
}
