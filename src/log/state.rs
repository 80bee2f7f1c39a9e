use std::collections::HashMap;

use super::{Checkpoint, LogEntry};
use crate::tree::MerkleTree;
use crate::Hash;

/// A combined state holding the merkle tree and the entries it commits to.
/// Readers holding the lock always see a tree, entry list and evidence index
/// of the same size.
#[derive(Default)]
pub struct MerkleState {
    /// Leaf hashes and cached interior nodes
    pub tree: MerkleTree,
    /// Entries in leaf order; `entries[i]` hashes to leaf `i`
    pub entries: Vec<LogEntry>,
    /// Checkpoints issued so far, oldest first
    pub checkpoints: Vec<Checkpoint>,
    /// Object key to every `(content hash, leaf index)` logged for it
    evidence: HashMap<String, Vec<(String, u64)>>,
}

impl MerkleState {
    /// Creates a new empty merkle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves.
    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    /// Pushes an entry and its leaf hash together, returning the leaf index.
    pub fn push(&mut self, entry: LogEntry, leaf_hash: Hash) -> u64 {
        let index = self.tree.push_leaf_hash(leaf_hash);
        self.entries.push(entry);
        index
    }

    /// Records that leaf `index` logged `content_hash` for `object_key`.
    pub fn index_evidence(&mut self, object_key: &str, content_hash: &str, index: u64) {
        self.evidence
            .entry(object_key.to_string())
            .or_default()
            .push((content_hash.to_string(), index));
    }

    /// Leaf that already logged this exact content for this key, if any.
    pub fn evidence_leaf(&self, object_key: &str, content_hash: &str) -> Option<u64> {
        self.evidence
            .get(object_key)?
            .iter()
            .find(|(hash, _)| hash == content_hash)
            .map(|(_, index)| *index)
    }

    /// Most recent leaf logged for `object_key`.
    pub fn latest_evidence_leaf(&self, object_key: &str) -> Option<u64> {
        self.evidence.get(object_key)?.last().map(|(_, index)| *index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryType;
    use chrono::Utc;

    #[test]
    fn tree_and_entries_move_together() {
        let mut state = MerkleState::new();
        let entry = LogEntry::new(EntryType::EvidenceStored, Utc::now(), "acme", b"x".to_vec()).unwrap();
        let hash = entry.leaf_hash().unwrap();
        assert_eq!(state.push(entry.clone(), hash), 0);
        assert_eq!(state.push(entry, hash), 1);
        assert_eq!(state.size(), 2);
        assert_eq!(state.entries.len(), 2);
    }

    #[test]
    fn evidence_index_tracks_content() {
        let mut state = MerkleState::new();
        state.index_evidence("k", "aa", 0);
        state.index_evidence("k", "bb", 3);
        assert_eq!(state.evidence_leaf("k", "aa"), Some(0));
        assert_eq!(state.evidence_leaf("k", "cc"), None);
        assert_eq!(state.latest_evidence_leaf("k"), Some(3));
        assert_eq!(state.latest_evidence_leaf("other"), None);
    }
}
