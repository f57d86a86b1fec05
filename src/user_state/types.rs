use crate::merkle::{Field, MerkleError, MerkleProof};
use crate::sync::SyncError;

/// Inputs for proving membership in the latest state tree the identity is part of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTreeInputs {
    pub epoch: u64,
    pub leaf_index: u64,
    pub state_tree_root: Field,
    pub state_tree_proof: MerkleProof,
    /// Provable data committed to by the leaf.
    pub data: Vec<Field>,
}

/// Data and epoch tree proof of one epoch key used in the epoch being left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochKeyInputs {
    pub nonce: u8,
    pub epoch_key: Field,
    pub data: Vec<Field>,
    pub epoch_tree_proof: MerkleProof,
}

/// Inputs for a user state transition out of `from_epoch` into `to_epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStateTransitionInputs {
    pub from_epoch: u64,
    pub to_epoch: u64,
    pub nullifier: Field,
    pub state_tree: StateTreeInputs,
    pub epoch_keys: Vec<EpochKeyInputs>,
    pub history_tree_root: Field,
    /// Proof that `from_epoch`'s final roots are in the history tree.
    pub history_tree_proof: MerkleProof,
    /// Provable data after the transition.
    pub new_data: Vec<Field>,
}

/// Error types for user state queries
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum UserStateError {
    #[error("Identity {0} has not signed up")]
    NotSignedUp(String),

    #[error("Epoch {requested} is beyond the current epoch {current}")]
    EpochBeyondCurrent { requested: u64, current: u64 },

    #[error("Identity has already transitioned to epoch {0}")]
    AlreadyTransitioned(u64),

    #[error("State tree leaf for epoch {0} not found")]
    LeafNotFound(u64),

    #[error("History tree leaf for epoch {0} not found")]
    HistoryLeafNotFound(u64),

    #[error("Sync error: {0}")]
    SyncError(#[from] SyncError),

    #[error("Merkle tree error: {0}")]
    MerkleError(#[from] MerkleError),
}
