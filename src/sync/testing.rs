//! Fixtures shared by synchronizer and user state tests.

use crate::config::{ProtocolConfig, SyncConfig};
use crate::ledger::{EventPosition, MemoryLedger};
use crate::merkle::Field;
use crate::sync::events::ProtocolEvent;
use crate::sync::store::LeafStore;
use crate::sync::synchronizer::Synchronizer;

use std::sync::Arc;

pub(crate) const ATTESTER: u64 = 0xa11ce;

pub(crate) fn attester() -> Field {
    Field::from(ATTESTER)
}

pub(crate) fn protocol() -> ProtocolConfig {
    ProtocolConfig {
        state_tree_depth: 8,
        epoch_tree_depth: 8,
        history_tree_depth: 8,
        field_count: 4,
        sum_field_count: 2,
        repl_nonce_bits: 8,
        num_epoch_key_nonce_per_epoch: 2,
    }
}

pub(crate) fn config() -> SyncConfig {
    SyncConfig {
        attester_id: format!("0x{:x}", ATTESTER),
        poll_interval_ms: 10,
        max_block_range: 4,
        protocol: protocol(),
        ..SyncConfig::default()
    }
}

pub(crate) fn synchronizer(store: Arc<LeafStore>, ledger: Arc<MemoryLedger>) -> Synchronizer {
    Synchronizer::new(store, ledger, config()).unwrap()
}

/// Appends events to a [`MemoryLedger`] with increasing log indices.
pub(crate) struct Script {
    pub ledger: Arc<MemoryLedger>,
    block: u64,
    tx: u64,
    log: u64,
}

impl Script {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            block: 1,
            tx: 0,
            log: 0,
        }
    }

    /// Emit the following events from transaction `tx` of `block`.
    pub fn at(&mut self, block: u64, tx: u64) -> &mut Self {
        self.block = block;
        self.tx = tx;
        self.log = 0;
        self
    }

    pub fn emit(&mut self, event: ProtocolEvent) -> EventPosition {
        let position = EventPosition {
            block_number: self.block,
            transaction_index: self.tx,
            log_index: self.log,
        };
        self.log += 1;
        self.ledger.push_event(event.encode(position));
        position
    }
}

pub(crate) fn attester_signed_up(timestamp: u64) -> ProtocolEvent {
    ProtocolEvent::AttesterSignedUp {
        attester_id: attester(),
        epoch_length: 300,
        timestamp,
    }
}

pub(crate) fn user_signed_up(epoch: u64, commitment: &Field, leaf_index: u64, leaf: &Field) -> ProtocolEvent {
    ProtocolEvent::UserSignedUp {
        epoch,
        identity_commitment: commitment.clone(),
        attester_id: attester(),
        leaf_index,
        leaf: leaf.clone(),
    }
}

pub(crate) fn attestation(epoch: u64, epoch_key: &Field, field_index: u64, change: &Field) -> ProtocolEvent {
    ProtocolEvent::Attestation {
        epoch,
        epoch_key: epoch_key.clone(),
        attester_id: attester(),
        field_index,
        change: change.clone(),
    }
}

pub(crate) fn user_state_transitioned(
    epoch: u64,
    leaf_index: u64,
    hashed_leaf: &Field,
    nullifier: &Field,
) -> ProtocolEvent {
    ProtocolEvent::UserStateTransitioned {
        epoch,
        attester_id: attester(),
        leaf_index,
        hashed_leaf: hashed_leaf.clone(),
        nullifier: nullifier.clone(),
    }
}

pub(crate) fn epoch_ended(epoch: u64) -> ProtocolEvent {
    ProtocolEvent::EpochEnded {
        epoch,
        attester_id: attester(),
    }
}

pub(crate) fn history_tree_leaf(leaf: &Field) -> ProtocolEvent {
    ProtocolEvent::HistoryTreeLeaf {
        attester_id: attester(),
        leaf: leaf.clone(),
    }
}
