//! Merkle engines used to rebuild protocol trees from persisted leaves.
//!
//! Two tree types are provided and they are deliberately distinct:
//!
//! - [`IncrementalTree`]: append-only, leaves land at the next free index. Used for the
//!   per-epoch state trees and the cross-epoch history tree.
//! - [`SparseTree`]: keyed by index with upsert semantics. Used for epoch trees, which
//!   are keyed by epoch-key value.
//!
//! Neither tree is ever persisted. Callers rebuild them from leaf rows on demand.

/// Field element type and the protocol hash
pub mod hash;
/// Append-only incremental tree
pub mod incremental;
/// Key-indexed sparse tree
pub mod sparse;

pub use hash::{Field, hash_many, hash2, snark_scalar_field, to_field, to_word};
pub use incremental::IncrementalTree;
pub use sparse::SparseTree;

/// Deepest tree supported. Leaf indices must fit the store's signed 64-bit integers.
pub const MAX_TREE_DEPTH: u8 = 62;

/// Errors raised by the Merkle engines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("Tree depth {0} is not supported (expected 1..={MAX_TREE_DEPTH})")]
    InvalidDepth(u8),

    #[error("Index {index} is out of range (limit {limit})")]
    IndexOutOfRange { index: u64, limit: u64 },

    #[error("Tree of depth {0} is full")]
    TreeFull(u8),
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub root: Field,
    pub leaf: Field,
    pub index: u64,
    /// Sibling nodes from the leaf level upwards.
    pub siblings: Vec<Field>,
    /// 1 where the proven node is a right child at that level.
    pub path_indices: Vec<u8>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and path and compare it with `root`.
    pub fn verify(&self) -> bool {
        let mut node = self.leaf.clone();
        for (sibling, is_right) in self.siblings.iter().zip(&self.path_indices) {
            node = if *is_right == 1 {
                hash2(sibling, &node)
            } else {
                hash2(&node, sibling)
            };
        }
        node == self.root
    }
}

/// The shared surface of both tree types.
pub trait MerkleTree {
    fn depth(&self) -> u8;

    fn root(&self) -> Field;

    fn proof(&self, index: u64) -> Result<MerkleProof, MerkleError>;
}

/// Default node values for each level, `zeros[0]` being the default leaf.
pub(crate) fn zero_hashes(depth: u8, default_leaf: &Field) -> Vec<Field> {
    let mut zeros = Vec::with_capacity(depth as usize + 1);
    zeros.push(default_leaf.clone());
    for level in 0..depth as usize {
        let next = hash2(&zeros[level], &zeros[level]);
        zeros.push(next);
    }
    zeros
}

pub(crate) fn check_depth(depth: u8) -> Result<(), MerkleError> {
    if depth == 0 || depth > MAX_TREE_DEPTH {
        return Err(MerkleError::InvalidDepth(depth));
    }
    Ok(())
}
