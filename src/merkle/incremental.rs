//! Append-only incremental Merkle tree.

use super::{Field, MerkleError, MerkleProof, MerkleTree, check_depth, hash2, zero_hashes};

/// A fixed-depth tree whose leaves are always inserted at the next free index.
///
/// The root depends only on the ordered leaf sequence, so rebuilding from the
/// persisted leaves of an epoch always reproduces the ledger's root.
#[derive(Debug, Clone)]
pub struct IncrementalTree {
    depth: u8,
    zeros: Vec<Field>,
    /// `layers[0]` holds the leaves, `layers[depth]` the root once non-empty.
    layers: Vec<Vec<Field>>,
}

impl IncrementalTree {
    /// Create an empty tree.
    pub fn new(depth: u8, default_leaf: Field) -> Result<Self, MerkleError> {
        check_depth(depth)?;
        Ok(Self {
            depth,
            zeros: zero_hashes(depth, &default_leaf),
            layers: vec![Vec::new(); depth as usize + 1],
        })
    }

    /// Build a tree from an ordered leaf sequence in one pass, level by level.
    pub fn from_leaves<I>(depth: u8, default_leaf: Field, leaves: I) -> Result<Self, MerkleError>
    where
        I: IntoIterator<Item = Field>,
    {
        let mut tree = Self::new(depth, default_leaf)?;
        let leaves: Vec<Field> = leaves.into_iter().collect();
        if leaves.len() as u64 > tree.capacity() {
            return Err(MerkleError::TreeFull(depth));
        }

        tree.layers[0] = leaves;
        for level in 0..depth as usize {
            let zero = &tree.zeros[level];
            let next: Vec<Field> = tree.layers[level]
                .chunks(2)
                .map(|pair| hash2(&pair[0], pair.get(1).unwrap_or(zero)))
                .collect();
            tree.layers[level + 1] = next;
        }
        Ok(tree)
    }

    /// Maximum number of leaves.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    pub fn len(&self) -> u64 {
        self.layers[0].len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.layers[0].is_empty()
    }

    pub fn leaves(&self) -> &[Field] {
        &self.layers[0]
    }

    /// Position of the first leaf equal to `leaf`.
    pub fn index_of(&self, leaf: &Field) -> Option<u64> {
        self.layers[0]
            .iter()
            .position(|l| l == leaf)
            .map(|i| i as u64)
    }

    /// Append a leaf and return its index.
    pub fn insert(&mut self, leaf: Field) -> Result<u64, MerkleError> {
        if self.len() >= self.capacity() {
            return Err(MerkleError::TreeFull(self.depth));
        }

        self.layers[0].push(leaf);
        let inserted = self.len() - 1;

        let mut index = inserted as usize;
        for level in 0..self.depth as usize {
            let parent = index / 2;
            let left = &self.layers[level][parent * 2];
            let right = self.layers[level]
                .get(parent * 2 + 1)
                .unwrap_or(&self.zeros[level]);
            let node = hash2(left, right);

            let upper = &mut self.layers[level + 1];
            if parent < upper.len() {
                upper[parent] = node;
            } else {
                upper.push(node);
            }
            index = parent;
        }

        Ok(inserted)
    }
}

impl MerkleTree for IncrementalTree {
    fn depth(&self) -> u8 {
        self.depth
    }

    fn root(&self) -> Field {
        self.layers[self.depth as usize]
            .first()
            .cloned()
            .unwrap_or_else(|| self.zeros[self.depth as usize].clone())
    }

    fn proof(&self, index: u64) -> Result<MerkleProof, MerkleError> {
        if index >= self.len() {
            return Err(MerkleError::IndexOutOfRange {
                index,
                limit: self.len(),
            });
        }

        let mut siblings = Vec::with_capacity(self.depth as usize);
        let mut path_indices = Vec::with_capacity(self.depth as usize);
        let mut position = index as usize;
        for level in 0..self.depth as usize {
            let sibling = self.layers[level]
                .get(position ^ 1)
                .unwrap_or(&self.zeros[level]);
            siblings.push(sibling.clone());
            path_indices.push((position & 1) as u8);
            position /= 2;
        }

        Ok(MerkleProof {
            root: self.root(),
            leaf: self.layers[0][index as usize].clone(),
            index,
            siblings,
            path_indices,
        })
    }
}
