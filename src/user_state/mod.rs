//! User State Module
//!
//! Derives one identity's reputation from the synchronized leaf store:
//!
//! - `crypto`: Identity secrets and the protocol's derived values (epoch keys, nullifiers, leaves).
//! - `data`: The reputation vector and the attestation fold.
//! - `aggregator`: [`UserState`], which answers data queries and assembles proof inputs.
//! - `types`: Proof input structures and user state errors.

/// Per-identity queries over a synchronizer
pub mod aggregator;
/// Identity secrets and derived protocol values
pub mod crypto;
/// Reputation vectors
pub mod data;
/// Proof inputs and errors
pub mod types;

pub use aggregator::UserState;
pub use crypto::{
    Identity, gen_epoch_key, gen_epoch_tree_leaf, gen_history_tree_leaf, gen_nullifier,
    gen_state_tree_leaf,
};
pub use data::ReputationData;
pub use types::*;
