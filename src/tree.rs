use crate::{ConsistencyProof, Hash, InclusionProof};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// SHA-256 hash size in bytes
pub const LEAF_HASH_SIZE: u64 = 32;

/// Domain separation prefix for leaf hashes
const LEAF_PREFIX: u8 = 0x00;
/// Domain separation prefix for interior node hashes
const NODE_PREFIX: u8 = 0x01;

/// Error type for proof operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    /// The requested leaf index or tree size is beyond the current tree
    #[error("requested {requested} is out of range for tree of size {tree_size}")]
    OutOfRange {
        /// The index or size asked for
        requested: u64,
        /// The number of leaves in the tree
        tree_size: u64,
    },
    /// The old size of a consistency request is larger than the new size
    #[error("old size {old_size} exceeds new size {new_size}")]
    InvalidRange {
        /// Requested old size
        old_size: u64,
        /// Requested new size
        new_size: u64,
    },
}

/// Hashes raw leaf data as `H(0x00 || data)`.
#[must_use]
pub fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes two child hashes as `H(0x01 || left || right)`.
#[must_use]
pub fn hash_children(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of the empty tree, `H("")`.
#[must_use]
pub fn empty_root() -> Hash {
    Sha256::digest([]).into()
}

/// Largest power of two strictly smaller than `n` (n >= 2).
const fn split_point(n: u64) -> u64 {
    1 << (63 - (n - 1).leading_zeros())
}

/// An append-only Merkle tree following the Certificate Transparency construction.
///
/// Interior hashes are memoised per `(start, end)` range. Only complete,
/// aligned subtrees are kept: their hash depends solely on leaves that can
/// never change, so appends only ever add cache entries. Ragged right-edge
/// ranges are recomputed from at most `log2(n)` cached pieces.
pub struct MerkleTree {
    /// Leaf hashes in append order
    leaves: Vec<Hash>,
    /// Cached hashes of complete aligned subtrees of two or more leaves
    nodes: HashMap<(u64, u64), Hash>,
    /// Maps leaf hash to the first index it was appended at
    leaf_hash_to_index: HashMap<Hash, u64>,
}

impl MerkleTree {
    /// Creates a new empty merkle tree
    #[must_use]
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            nodes: HashMap::new(),
            leaf_hash_to_index: HashMap::new(),
        }
    }

    /// Hashes `data` as a leaf, appends it and returns its index.
    pub fn add_leaf(&mut self, data: &[u8]) -> u64 {
        self.push_leaf_hash(hash_leaf(data))
    }

    /// Appends an already computed leaf hash and returns its index.
    pub fn push_leaf_hash(&mut self, leaf: Hash) -> u64 {
        let index = self.size();
        self.invalidate_covering(index);
        self.leaves.push(leaf);
        self.leaf_hash_to_index.entry(leaf).or_insert(index);
        self.cache_completed_subtrees(index);
        index
    }

    /// Gets the current root hash
    #[must_use]
    pub fn root(&self) -> Hash {
        self.range_hash(0, self.size())
    }

    /// Gets the root hash the tree had when it held `size` leaves.
    ///
    /// # Errors
    ///
    /// - `ProofError::OutOfRange`: if `size` exceeds the current tree size
    pub fn root_at(&self, size: u64) -> Result<Hash, ProofError> {
        self.check_size(size)?;
        Ok(self.range_hash(0, size))
    }

    /// Gets the current number of leaves in the tree
    #[must_use]
    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Returns true if the tree is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Gets the leaf hash stored at `index`
    #[must_use]
    pub fn leaf_hash(&self, index: u64) -> Option<Hash> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.leaves.get(i))
            .copied()
    }

    /// Gets the index for a given leaf hash
    #[must_use]
    pub fn get_index(&self, hash: &Hash) -> Option<u64> {
        self.leaf_hash_to_index.get(hash).copied()
    }

    /// Number of memoised interior hashes
    #[must_use]
    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Generates an inclusion proof for `index` against the current tree.
    ///
    /// # Errors
    ///
    /// - `ProofError::OutOfRange`: if `index` is not below the tree size
    pub fn inclusion_proof(&self, index: u64) -> Result<InclusionProof, ProofError> {
        self.inclusion_proof_at(index, self.size())
    }

    /// Generates an inclusion proof for `index` in the tree of `tree_size` leaves.
    ///
    /// # Errors
    ///
    /// - `ProofError::OutOfRange`: if `tree_size` exceeds the tree or `index >= tree_size`
    pub fn inclusion_proof_at(
        &self,
        index: u64,
        tree_size: u64,
    ) -> Result<InclusionProof, ProofError> {
        self.check_size(tree_size)?;
        if index >= tree_size {
            return Err(ProofError::OutOfRange {
                requested: index,
                tree_size,
            });
        }
        let leaf_hash = self
            .leaf_hash(index)
            .ok_or(ProofError::OutOfRange {
                requested: index,
                tree_size: self.size(),
            })?;

        let mut path = Vec::new();
        self.audit_path(index, 0, tree_size, &mut path);

        Ok(InclusionProof {
            leaf_index: index,
            leaf_hash,
            tree_size,
            path,
        })
    }

    /// Generates a proof that the tree of `old_size` leaves is a prefix of the
    /// tree of `new_size` leaves.
    ///
    /// If the sizes are equal, or the old tree is empty, the proof is empty.
    ///
    /// # Errors
    ///
    /// - `ProofError::InvalidRange`: if `old_size > new_size`
    /// - `ProofError::OutOfRange`: if `new_size` exceeds the tree size
    pub fn consistency_proof(
        &self,
        old_size: u64,
        new_size: u64,
    ) -> Result<ConsistencyProof, ProofError> {
        if old_size > new_size {
            return Err(ProofError::InvalidRange { old_size, new_size });
        }
        self.check_size(new_size)?;

        let mut path = Vec::new();
        if old_size > 0 && old_size < new_size {
            self.subproof(old_size, 0, new_size, true, &mut path);
        }

        Ok(ConsistencyProof {
            old_size,
            new_size,
            path,
        })
    }

    /// Verifies an inclusion proof against an expected root.
    #[must_use]
    pub fn verify_inclusion_proof(proof: &InclusionProof, expected_root: &Hash) -> bool {
        proof.verify(expected_root)
    }

    /// Verifies a consistency proof between two roots.
    #[must_use]
    pub fn verify_consistency_proof(
        proof: &ConsistencyProof,
        old_root: &Hash,
        new_root: &Hash,
    ) -> bool {
        proof.verify(old_root, new_root)
    }

    fn check_size(&self, size: u64) -> Result<(), ProofError> {
        if size > self.size() {
            return Err(ProofError::OutOfRange {
                requested: size,
                tree_size: self.size(),
            });
        }
        Ok(())
    }

    /// Hash of the leaves in `[start, end)`.
    fn range_hash(&self, start: u64, end: u64) -> Hash {
        match end - start {
            0 => empty_root(),
            1 => self.leaves[start as usize],
            n => {
                if let Some(hash) = self.nodes.get(&(start, end)) {
                    return *hash;
                }
                let k = split_point(n);
                hash_children(
                    &self.range_hash(start, start + k),
                    &self.range_hash(start + k, end),
                )
            }
        }
    }

    /// Caches every aligned subtree that the leaf at `index` just completed.
    fn cache_completed_subtrees(&mut self, index: u64) {
        let end = index + 1;
        let mut width = 2u64;
        while end % width == 0 {
            let start = end - width;
            let mid = start + width / 2;
            let hash = hash_children(&self.range_hash(start, mid), &self.range_hash(mid, end));
            self.nodes.insert((start, end), hash);
            width <<= 1;
        }
    }

    /// Drops every cached range that covers leaf `index`, one per level.
    fn invalidate_covering(&mut self, index: u64) {
        let mut width = 2u64;
        while width <= self.size().max(index + 1).next_power_of_two() {
            let start = index / width * width;
            self.nodes.remove(&(start, start + width));
            width <<= 1;
        }
    }

    /// RFC 6962 PATH(m, D[start:end]) with `m` relative to `start`.
    fn audit_path(&self, m: u64, start: u64, end: u64, path: &mut Vec<Hash>) {
        let n = end - start;
        if n <= 1 {
            return;
        }
        let k = split_point(n);
        if m < k {
            self.audit_path(m, start, start + k, path);
            path.push(self.range_hash(start + k, end));
        } else {
            self.audit_path(m - k, start + k, end, path);
            path.push(self.range_hash(start, start + k));
        }
    }

    /// RFC 6962 SUBPROOF(m, D[start:end], b).
    fn subproof(&self, m: u64, start: u64, end: u64, complete: bool, path: &mut Vec<Hash>) {
        let n = end - start;
        if m == n {
            if !complete {
                path.push(self.range_hash(start, end));
            }
            return;
        }
        let k = split_point(n);
        if m <= k {
            self.subproof(m, start, start + k, complete, path);
            path.push(self.range_hash(start + k, end));
        } else {
            self.subproof(m - k, start + k, end, false, path);
            path.push(self.range_hash(start, start + k));
        }
    }

    /// Overwrites a stored leaf hash, bypassing the append-only contract.
    #[cfg(test)]
    pub(crate) fn corrupt_leaf(&mut self, index: u64, hash: Hash) {
        self.leaves[index as usize] = hash;
        self.invalidate_covering(index);
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 9162 §2.1.3.2 inclusion verification.
pub(crate) fn verify_inclusion(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &Hash,
    path: &[Hash],
    root: &Hash,
) -> bool {
    if leaf_index >= tree_size {
        return false;
    }
    let mut fn_ = leaf_index;
    let mut sn = tree_size - 1;
    let mut r = *leaf_hash;

    for p in path {
        if sn == 0 {
            return false;
        }
        if fn_ & 1 == 1 || fn_ == sn {
            r = hash_children(p, &r);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            r = hash_children(&r, p);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    sn == 0 && r == *root
}

/// RFC 9162 §2.1.4.2 consistency verification.
pub(crate) fn verify_consistency(
    old_size: u64,
    new_size: u64,
    path: &[Hash],
    old_root: &Hash,
    new_root: &Hash,
) -> bool {
    if old_size > new_size {
        return false;
    }
    if old_size == new_size {
        return path.is_empty() && old_root == new_root;
    }
    if old_size == 0 {
        return path.is_empty() && *old_root == empty_root();
    }
    if path.is_empty() {
        return false;
    }

    let mut nodes: Vec<Hash> = Vec::with_capacity(path.len() + 1);
    if old_size.is_power_of_two() {
        nodes.push(*old_root);
    }
    nodes.extend_from_slice(path);

    let mut fn_ = old_size - 1;
    let mut sn = new_size - 1;
    while fn_ & 1 == 1 {
        fn_ >>= 1;
        sn >>= 1;
    }

    let mut fr = nodes[0];
    let mut sr = nodes[0];
    for c in &nodes[1..] {
        if sn == 0 {
            return false;
        }
        if fn_ & 1 == 1 || fn_ == sn {
            fr = hash_children(c, &fr);
            sr = hash_children(c, &sr);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            sr = hash_children(&sr, c);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    fr == *old_root && sr == *new_root && sn == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Direct recursive MTH from RFC 6962, no caching.
    fn reference_root(leaves: &[Vec<u8>]) -> Hash {
        match leaves.len() {
            0 => empty_root(),
            1 => hash_leaf(&leaves[0]),
            n => {
                let k = split_point(n as u64) as usize;
                hash_children(&reference_root(&leaves[..k]), &reference_root(&leaves[k..]))
            }
        }
    }

    fn tree_of(leaves: &[&str]) -> MerkleTree {
        let mut tree = MerkleTree::new();
        for leaf in leaves {
            tree.add_leaf(leaf.as_bytes());
        }
        tree
    }

    #[test]
    fn test_empty_tree_root() {
        let tree = MerkleTree::new();
        assert!(tree.is_empty());
        assert_eq!(
            hex::encode(tree.root()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_domain_separation() {
        let a = hash_leaf(b"a");
        let b = hash_leaf(b"b");
        let node = hash_children(&a, &b);
        let mut concat = Vec::new();
        concat.extend_from_slice(&a);
        concat.extend_from_slice(&b);
        // An interior node must not be presentable as a leaf over the same bytes.
        assert_ne!(hash_leaf(&concat), node);
    }

    #[test]
    fn test_split_point() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(8), 4);
        assert_eq!(split_point(9), 8);
    }

    #[test]
    fn test_cache_holds_only_complete_subtrees() {
        let tree = tree_of(&["a", "b", "c", "d", "e", "f", "g"]);
        // [0,2) [2,4) [4,6) [0,4)
        assert_eq!(tree.cached_nodes(), 4);
        assert!(tree.nodes.contains_key(&(0, 4)));
        assert!(!tree.nodes.contains_key(&(4, 7)));
    }

    #[test]
    fn test_valid_inclusion_proof() {
        let tree = tree_of(&["a", "b", "c"]);
        let proof = tree.inclusion_proof(0).expect("Should create proof");
        assert_eq!(proof.path.len(), 2);
        assert!(proof.verify(&tree.root()), "Valid inclusion proof should verify");
    }

    #[test]
    fn test_invalid_inclusion_proof() {
        let tree = tree_of(&["a", "b", "c"]);
        let mut proof = tree.inclusion_proof(0).expect("Should create proof");
        proof.leaf_hash = hash_leaf(b"z");
        assert!(
            !proof.verify(&tree.root()),
            "Proof for the wrong leaf should fail verification"
        );
    }

    #[test]
    fn test_inclusion_out_of_range() {
        let tree = tree_of(&["a", "b"]);
        assert!(matches!(
            tree.inclusion_proof(2),
            Err(ProofError::OutOfRange { requested: 2, tree_size: 2 })
        ));
        assert!(matches!(
            tree.inclusion_proof_at(0, 3),
            Err(ProofError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_consistency_invalid_range() {
        let tree = tree_of(&["a", "b", "c"]);
        assert_eq!(
            tree.consistency_proof(3, 2).unwrap_err(),
            ProofError::InvalidRange { old_size: 3, new_size: 2 }
        );
        assert!(matches!(
            tree.consistency_proof(1, 4),
            Err(ProofError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_consistency_proof_with_same_size() {
        let tree = tree_of(&["a", "b", "c"]);
        let proof = tree.consistency_proof(3, 3).expect("Same size should return a proof");
        assert!(proof.path.is_empty(), "Same size consistency proof should have empty path");
        assert!(proof.verify(&tree.root(), &tree.root()));

        let other = tree_of(&["x", "b", "c"]);
        assert!(!proof.verify(&tree.root(), &other.root()));
    }

    #[test]
    fn test_consistency_from_empty_tree() {
        let tree = tree_of(&["a", "b", "c"]);
        let proof = tree.consistency_proof(0, 3).expect("Should create proof");
        assert!(proof.verify(&empty_root(), &tree.root()));
    }

    #[test]
    fn test_wrong_old_root_fails_consistency() {
        let tree = tree_of(&["a", "b", "c", "d", "e"]);
        let proof = tree.consistency_proof(3, 5).expect("Should create proof");
        let fake_root = [9u8; 32];
        assert!(!proof.verify(&fake_root, &tree.root()));
        assert!(!proof.verify(&tree.root_at(3).unwrap(), &fake_root));
    }

    #[test]
    fn test_rfc6962_reference_vectors() {
        // Leaves and roots from the Certificate Transparency reference test data.
        let inputs: [&[u8]; 8] = [
            b"",
            &[0x00],
            &[0x10],
            &[0x20, 0x21],
            &[0x30, 0x31],
            &[0x40, 0x41, 0x42, 0x43],
            &[0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57],
            &[
                0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c,
                0x6d, 0x6e, 0x6f,
            ],
        ];
        let roots = [
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d",
            "fac54203e7cc696cf0dfcb42c92a1d9dbaf70ad9e621f4bd8d98662f00e3c125",
            "aeb6bcfe274b70a14fb067a5e5578264db0fa9b51af5e0ba159158f329e06e77",
            "d37ee418976dd95753c1c73862b9398fa2a2cf9b4ff0fdfe8b30cd95209614b7",
            "4e3bbb1f7b478dcfe71fb631631519a3bca12c9aefca1612bfce4c13a86264d4",
            "76e67dadbcdf1e10e1b74ddc608abd2f98dfb16fbce75277b5232a127f2087ef",
            "ddb89be403809e325750d3d263cd78929c2942b7942a34b77e122c9594a74c8c",
            "5dc9da79a70659a9ad559cb701ded9a2ab9d823aad2f4960cfe370eff4604328",
        ];
        let mut tree = MerkleTree::new();
        for (input, root) in inputs.iter().zip(roots) {
            tree.add_leaf(input);
            assert_eq!(hex::encode(tree.root()), root, "root at size {}", tree.size());
        }
    }

    #[test]
    fn test_five_leaf_scenario() {
        let mut tree = MerkleTree::new();
        let mut roots = Vec::new();
        for leaf in ["a", "b", "c", "d", "e"] {
            tree.add_leaf(leaf.as_bytes());
            roots.push(tree.root());
        }
        let root_after_c = roots[2];
        let root_after_d = roots[3];
        assert_ne!(root_after_d, root_after_c);

        let proof = tree.consistency_proof(3, 5).expect("Should create proof");
        assert!(proof.verify(&root_after_c, &tree.root()));

        let untouched_root = tree.root();
        tree.corrupt_leaf(1, hash_leaf(b"tampered"));
        let proof = tree.inclusion_proof(1).expect("Should create proof");
        assert!(
            !proof.verify(&untouched_root),
            "Proof built from a corrupted leaf must not verify against the committed root"
        );
    }

    #[test]
    fn test_corrupt_leaf_invalidates_only_covering_ranges() {
        let mut tree = tree_of(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        assert_eq!(tree.cached_nodes(), 7);
        tree.corrupt_leaf(1, hash_leaf(b"x"));
        // [0,2) [0,4) [0,8) dropped; [2,4) [4,6) [6,8) [4,8) kept
        assert_eq!(tree.cached_nodes(), 4);
        assert!(tree.nodes.contains_key(&(4, 8)));
        assert_eq!(tree.root(), {
            let mut expected = MerkleTree::new();
            for leaf in ["a", "x", "c", "d", "e", "f", "g", "h"] {
                if leaf == "x" {
                    expected.push_leaf_hash(hash_leaf(b"x"));
                } else {
                    expected.add_leaf(leaf.as_bytes());
                }
            }
            expected.root()
        });
    }

    #[test]
    fn test_get_index() {
        let tree = tree_of(&["a", "b", "a"]);
        assert_eq!(tree.get_index(&hash_leaf(b"a")), Some(0));
        assert_eq!(tree.get_index(&hash_leaf(b"b")), Some(1));
        assert_eq!(tree.get_index(&hash_leaf(b"c")), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_root_matches_reference(leaves in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..40)) {
            let mut tree = MerkleTree::new();
            for (i, leaf) in leaves.iter().enumerate() {
                tree.add_leaf(leaf);
                prop_assert_eq!(tree.root(), reference_root(&leaves[..=i]));
            }
        }

        #[test]
        fn prop_every_inclusion_proof_verifies(n in 1usize..70) {
            let mut tree = MerkleTree::new();
            for i in 0..n {
                tree.add_leaf(&(i as u64).to_be_bytes());
            }
            let root = tree.root();
            for i in 0..n as u64 {
                let proof = tree.inclusion_proof(i).unwrap();
                prop_assert!(proof.verify(&root), "leaf {} of {}", i, n);
                if n > 1 {
                    let wrong = InclusionProof { leaf_index: (i + 1) % n as u64, ..proof.clone() };
                    prop_assert!(!wrong.verify(&root));
                }
            }
        }

        #[test]
        fn prop_historical_inclusion_verifies(n in 1u64..50, seed in any::<u64>()) {
            let mut tree = MerkleTree::new();
            for i in 0..n {
                tree.add_leaf(&i.to_le_bytes());
            }
            let size = seed % n + 1;
            let index = seed % size;
            let proof = tree.inclusion_proof_at(index, size).unwrap();
            prop_assert!(proof.verify(&tree.root_at(size).unwrap()));
        }

        #[test]
        fn prop_every_consistency_proof_verifies(n in 1u64..40) {
            let mut tree = MerkleTree::new();
            for i in 0..n {
                tree.add_leaf(&i.to_le_bytes());
            }
            for new_size in 0..=n {
                let new_root = tree.root_at(new_size).unwrap();
                for old_size in 0..=new_size {
                    let old_root = tree.root_at(old_size).unwrap();
                    let proof = tree.consistency_proof(old_size, new_size).unwrap();
                    prop_assert!(proof.verify(&old_root, &new_root), "{} -> {}", old_size, new_size);
                    if old_size > 0 && old_size < new_size {
                        let mut bad = old_root;
                        bad[0] ^= 1;
                        prop_assert!(!proof.verify(&bad, &new_root));
                    }
                }
            }
        }

        #[test]
        fn prop_reversed_range_is_rejected(old in 1u64..30, delta in 1u64..10) {
            let mut tree = MerkleTree::new();
            for i in 0..(old + delta) {
                tree.add_leaf(&i.to_le_bytes());
            }
            let is_invalid_range = matches!(
                tree.consistency_proof(old + delta, old),
                Err(ProofError::InvalidRange { .. })
            );
            prop_assert!(is_invalid_range);
        }
    }
}
