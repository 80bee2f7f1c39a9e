use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{Checkpoint, LogEntry};
use crate::error::{Error, Result};
use crate::Hash;

/// An entry as persisted, with its position and leaf hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Leaf index
    pub index: u64,
    /// The entry
    pub entry: LogEntry,
    /// Leaf hash recorded at append time
    pub leaf_hash: Hash,
}

/// Durable storage behind a transparency log.
///
/// `append_entry` must be durable when it returns `Ok`. Writing the same
/// `(origin, index)` twice with the same leaf hash is a no-op, so a retried
/// append whose first attempt actually committed still succeeds. A different
/// leaf hash at an occupied index is a consistency violation.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persists one entry at `index`.
    async fn append_entry(
        &self,
        origin: &str,
        index: u64,
        entry: &LogEntry,
        leaf_hash: &Hash,
    ) -> Result<()>;

    /// All entries of `origin` in leaf order.
    async fn load_entries(&self, origin: &str) -> Result<Vec<StoredEntry>>;

    /// Persists a checkpoint.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All checkpoints of `origin`, oldest first.
    async fn load_checkpoints(&self, origin: &str) -> Result<Vec<Checkpoint>>;
}

/// In-process log store, used for tests and when no database is configured.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: RwLock<HashMap<String, Vec<StoredEntry>>>,
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
    fail_next: AtomicU32,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` appends fail with a transient storage error.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of entries persisted for `origin`.
    #[must_use]
    pub fn len(&self, origin: &str) -> usize {
        self.entries.read().get(origin).map_or(0, Vec::len)
    }

    /// Returns true if nothing was persisted for `origin`.
    #[must_use]
    pub fn is_empty(&self, origin: &str) -> bool {
        self.len(origin) == 0
    }

    /// Rewrites a persisted entry in place, as an attacker with database
    /// access could.
    #[cfg(test)]
    pub(crate) fn tamper(&self, origin: &str, index: usize, entry: LogEntry) {
        if let Some(stored) = self
            .entries
            .write()
            .get_mut(origin)
            .and_then(|entries| entries.get_mut(index))
        {
            stored.entry = entry;
        }
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_entry(
        &self,
        origin: &str,
        index: u64,
        entry: &LogEntry,
        leaf_hash: &Hash,
    ) -> Result<()> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient("injected append failure"));
        }

        let mut entries = self.entries.write();
        let log = entries.entry(origin.to_string()).or_default();
        let expected = log.len() as u64;

        if index < expected {
            let existing = &log[index as usize];
            if existing.leaf_hash == *leaf_hash {
                return Ok(());
            }
            return Err(Error::consistency_violation(format!(
                "index {index} of '{origin}' already holds a different leaf"
            )));
        }
        if index > expected {
            return Err(Error::consistency_violation(format!(
                "append at {index} would leave a gap after {expected} entries of '{origin}'"
            )));
        }

        log.push(StoredEntry {
            index,
            entry: entry.clone(),
            leaf_hash: *leaf_hash,
        });
        Ok(())
    }

    async fn load_entries(&self, origin: &str) -> Result<Vec<StoredEntry>> {
        Ok(self.entries.read().get(origin).cloned().unwrap_or_default())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .entry(checkpoint.origin.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoints(&self, origin: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.read().get(origin).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryType;
    use chrono::Utc;

    fn entry(payload: &[u8]) -> LogEntry {
        LogEntry::new(EntryType::HoldPlaced, Utc::now(), "acme", payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn appends_are_dense_and_idempotent() {
        let store = MemoryLogStore::new();
        let a = entry(b"a");
        let ha = a.leaf_hash().unwrap();
        store.append_entry("log", 0, &a, &ha).await.unwrap();
        // replaying the same append is harmless
        store.append_entry("log", 0, &a, &ha).await.unwrap();
        assert_eq!(store.len("log"), 1);

        let b = entry(b"b");
        let hb = b.leaf_hash().unwrap();
        assert!(matches!(
            store.append_entry("log", 0, &b, &hb).await,
            Err(Error::ConsistencyViolation(_))
        ));
        assert!(matches!(
            store.append_entry("log", 5, &b, &hb).await,
            Err(Error::ConsistencyViolation(_))
        ));
        store.append_entry("log", 1, &b, &hb).await.unwrap();

        let loaded = store.load_entries("log").await.unwrap();
        assert_eq!(loaded.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 1]);
        assert!(store.is_empty("other"));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryLogStore::new();
        store.fail_next_appends(1);
        let a = entry(b"a");
        let ha = a.leaf_hash().unwrap();
        let err = store.append_entry("log", 0, &a, &ha).await.unwrap_err();
        assert!(err.is_retryable());
        store.append_entry("log", 0, &a, &ha).await.unwrap();
    }
}
