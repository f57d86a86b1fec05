//! Identity secrets and the pure derivations built on them.
//!
//! Every value here is a deterministic function of its inputs: the same identity always
//! derives the same commitment, epoch keys and nullifiers, which is what lets the user state
//! locate its own rows in the leaf store without persisting any of them.

use crate::merkle::{Field, hash_many, hash2, to_field};

use num_bigint::BigUint;
use rand::RngCore;
use std::fmt;
use std::iter;

/// Domain tags keep derivations with equal arity apart.
const EPOCH_KEY_DOMAIN: u64 = 1;
const NULLIFIER_DOMAIN: u64 = 2;
const STATE_LEAF_DOMAIN: u64 = 3;

/// A user identity, known only to its holder.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    secret: Field,
}

impl Identity {
    pub fn new(secret: Field) -> Self {
        Self {
            secret: to_field(&secret),
        }
    }

    /// A fresh identity with a uniformly random secret.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::new(BigUint::from_bytes_be(&bytes))
    }

    pub fn secret(&self) -> &Field {
        &self.secret
    }

    /// The public commitment registered at sign-up.
    pub fn commitment(&self) -> Field {
        hash_many(iter::once(&self.secret))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("commitment", &self.commitment())
            .finish_non_exhaustive()
    }
}

/// Epoch key number `nonce` of an identity in `epoch`, reduced to an index of an epoch tree
/// of depth `epoch_tree_depth`.
pub fn gen_epoch_key(
    secret: &Field,
    attester_id: &Field,
    epoch: u64,
    nonce: u8,
    epoch_tree_depth: u8,
) -> Field {
    let inputs = [
        Field::from(EPOCH_KEY_DOMAIN),
        secret.clone(),
        attester_id.clone(),
        Field::from(epoch),
        Field::from(nonce),
    ];
    hash_many(&inputs) % (Field::from(1u8) << epoch_tree_depth)
}

/// Nullifier published when an identity transitions into `epoch`.
pub fn gen_nullifier(secret: &Field, attester_id: &Field, epoch: u64) -> Field {
    let inputs = [
        Field::from(NULLIFIER_DOMAIN),
        secret.clone(),
        attester_id.clone(),
        Field::from(epoch),
    ];
    hash_many(&inputs)
}

/// State tree leaf committing to an identity's provable data at `epoch`.
pub fn gen_state_tree_leaf(secret: &Field, attester_id: &Field, epoch: u64, data: &[Field]) -> Field {
    let header = [
        Field::from(STATE_LEAF_DOMAIN),
        secret.clone(),
        attester_id.clone(),
        Field::from(epoch),
    ];
    hash_many(header.iter().chain(data))
}

/// Epoch tree leaf holding the data accumulated by one epoch key.
pub fn gen_epoch_tree_leaf(epoch_key: &Field, data: &[Field]) -> Field {
    hash_many(iter::once(epoch_key).chain(data))
}

/// History tree leaf linking an epoch's final state tree and epoch tree roots.
pub fn gen_history_tree_leaf(state_tree_root: &Field, epoch_tree_root: &Field) -> Field {
    hash2(state_tree_root, epoch_tree_root)
}
