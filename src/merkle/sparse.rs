//! Sparse Merkle tree keyed by leaf index.

use super::{Field, MerkleError, MerkleProof, MerkleTree, check_depth, hash2, zero_hashes};
use std::collections::HashMap;

/// A fixed-depth tree where every key starts at the default leaf and can be
/// overwritten any number of times.
///
/// Writing the same `(key, value)` twice leaves the root unchanged, which is what
/// lets epoch-tree leaf rows be upserted during replay.
#[derive(Debug, Clone)]
pub struct SparseTree {
    depth: u8,
    zeros: Vec<Field>,
    /// Non-default nodes keyed by `(level, index)`.
    nodes: HashMap<(u8, u64), Field>,
}

impl SparseTree {
    pub fn new(depth: u8, default_leaf: Field) -> Result<Self, MerkleError> {
        check_depth(depth)?;
        Ok(Self {
            depth,
            zeros: zero_hashes(depth, &default_leaf),
            nodes: HashMap::new(),
        })
    }

    /// Number of addressable keys.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    fn node(&self, level: u8, index: u64) -> &Field {
        self.nodes
            .get(&(level, index))
            .unwrap_or(&self.zeros[level as usize])
    }

    fn check_key(&self, key: u64) -> Result<(), MerkleError> {
        if key >= self.capacity() {
            return Err(MerkleError::IndexOutOfRange {
                index: key,
                limit: self.capacity(),
            });
        }
        Ok(())
    }

    /// Current leaf value for `key`.
    pub fn get(&self, key: u64) -> Result<&Field, MerkleError> {
        self.check_key(key)?;
        Ok(self.node(0, key))
    }

    /// Set the leaf at `key` and rehash its path to the root.
    pub fn update(&mut self, key: u64, value: Field) -> Result<(), MerkleError> {
        self.check_key(key)?;

        self.nodes.insert((0, key), value);
        let mut index = key;
        for level in 0..self.depth {
            let node = if index & 1 == 1 {
                hash2(self.node(level, index ^ 1), self.node(level, index))
            } else {
                hash2(self.node(level, index), self.node(level, index ^ 1))
            };
            index /= 2;
            self.nodes.insert((level + 1, index), node);
        }
        Ok(())
    }
}

impl MerkleTree for SparseTree {
    fn depth(&self) -> u8 {
        self.depth
    }

    fn root(&self) -> Field {
        self.node(self.depth, 0).clone()
    }

    fn proof(&self, key: u64) -> Result<MerkleProof, MerkleError> {
        self.check_key(key)?;

        let mut siblings = Vec::with_capacity(self.depth as usize);
        let mut path_indices = Vec::with_capacity(self.depth as usize);
        let mut index = key;
        for level in 0..self.depth {
            siblings.push(self.node(level, index ^ 1).clone());
            path_indices.push((index & 1) as u8);
            index /= 2;
        }

        Ok(MerkleProof {
            root: self.root(),
            leaf: self.node(0, key).clone(),
            index: key,
            siblings,
            path_indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::IncrementalTree;
    use num_bigint::BigUint;

    fn value(n: u32) -> Field {
        BigUint::from(n)
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut tree = SparseTree::new(8, value(0)).unwrap();
        tree.update(17, value(5)).unwrap();
        let once = tree.root();
        tree.update(17, value(5)).unwrap();
        assert_eq!(tree.root(), once);
    }

    #[test]
    fn last_write_determines_root() {
        let mut overwritten = SparseTree::new(8, value(0)).unwrap();
        overwritten.update(3, value(1)).unwrap();
        overwritten.update(200, value(2)).unwrap();
        overwritten.update(3, value(9)).unwrap();

        let mut direct = SparseTree::new(8, value(0)).unwrap();
        direct.update(200, value(2)).unwrap();
        direct.update(3, value(9)).unwrap();

        assert_eq!(overwritten.root(), direct.root());
    }

    #[test]
    fn dense_prefix_matches_incremental_tree() {
        let mut sparse = SparseTree::new(4, value(0)).unwrap();
        for key in 0..6u64 {
            sparse.update(key, value(key as u32 + 1)).unwrap();
        }
        let incremental = IncrementalTree::from_leaves(4, value(0), (1..=6).map(value)).unwrap();
        assert_eq!(sparse.root(), incremental.root());
    }

    #[test]
    fn proofs_verify_for_set_and_default_keys() {
        let mut tree = SparseTree::new(6, value(0)).unwrap();
        tree.update(9, value(77)).unwrap();
        tree.update(40, value(12)).unwrap();

        let set = tree.proof(9).unwrap();
        assert_eq!(set.leaf, value(77));
        assert!(set.verify());

        let unset = tree.proof(10).unwrap();
        assert_eq!(unset.leaf, value(0));
        assert!(unset.verify());
    }

    #[test]
    fn keys_outside_the_tree_are_rejected() {
        let mut tree = SparseTree::new(3, value(0)).unwrap();
        assert_eq!(
            tree.update(8, value(1)),
            Err(MerkleError::IndexOutOfRange { index: 8, limit: 8 })
        );
        assert!(tree.proof(8).is_err());
    }
}
