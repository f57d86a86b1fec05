//! Event handlers.
//!
//! [`EventDispatcher::dispatch`] maps each [`EventKind`](crate::sync::events::EventKind) to exactly one handler with a static
//! `match`, so adding a kind without a handler fails to compile. Handlers only write through
//! the supplied [`StoreTx`] and never talk to the ledger, which keeps replay deterministic.
//!
//! A handler returns `Ok(true)` when it mutated this scope's rows and `Ok(false)` when the event
//! belongs to another attester scope. Any error aborts the enclosing transaction.

use crate::config::ProtocolConfig;
use crate::ledger::EventPosition;
use crate::merkle::Field;
use crate::sync::events::ProtocolEvent;
use crate::sync::repositories::StoreTx;
use crate::sync::types::SyncError;
use crate::user_state::{ReputationData, gen_epoch_tree_leaf};
use crate::utils::format_field;

use tracing::{debug, info};

/// Applies decoded events of one attester scope to the leaf store.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    attester_id: Field,
    protocol: ProtocolConfig,
}

impl EventDispatcher {
    pub fn new(attester_id: Field, protocol: ProtocolConfig) -> Self {
        Self {
            attester_id,
            protocol,
        }
    }

    /// Apply one event inside `tx`.
    pub fn dispatch(
        &self,
        tx: &StoreTx<'_>,
        event: &ProtocolEvent,
        position: EventPosition,
    ) -> Result<bool, SyncError> {
        if *event.attester_id() != self.attester_id {
            debug!(
                "Ignoring {:?} at {} for attester {}",
                event.kind(),
                position,
                format_field(event.attester_id())
            );
            return Ok(false);
        }

        let block = position.block_number;
        match event {
            ProtocolEvent::AttesterSignedUp {
                epoch_length,
                timestamp,
                ..
            } => self.handle_attester_signed_up(tx, *epoch_length, *timestamp),
            ProtocolEvent::UserSignedUp {
                epoch,
                identity_commitment,
                leaf_index,
                leaf,
                ..
            } => self.handle_user_signed_up(tx, *epoch, identity_commitment, *leaf_index, leaf, block),
            ProtocolEvent::UserStateTransitioned {
                epoch,
                leaf_index,
                hashed_leaf,
                nullifier,
                ..
            } => self.handle_user_state_transitioned(
                tx,
                *epoch,
                *leaf_index,
                hashed_leaf,
                nullifier,
                block,
            ),
            ProtocolEvent::Attestation {
                epoch,
                epoch_key,
                field_index,
                change,
                ..
            } => self.handle_attestation(tx, *epoch, epoch_key, *field_index, change, block),
            ProtocolEvent::StateTreeLeaf {
                epoch, index, leaf, ..
            } => self.handle_state_tree_leaf(tx, *epoch, *index, leaf, block),
            ProtocolEvent::EpochTreeLeaf {
                epoch, index, leaf, ..
            } => self.handle_epoch_tree_leaf(tx, *epoch, index, leaf, block),
            ProtocolEvent::EpochEnded { epoch, .. } => self.handle_epoch_ended(tx, *epoch),
            ProtocolEvent::HistoryTreeLeaf { leaf, .. } => {
                self.handle_history_tree_leaf(tx, leaf, block)
            }
        }
    }

    fn handle_attester_signed_up(
        &self,
        tx: &StoreTx<'_>,
        epoch_length: u64,
        timestamp: u64,
    ) -> Result<bool, SyncError> {
        if !tx.insert_attester(&self.attester_id, epoch_length, timestamp)? {
            return Err(SyncError::ProtocolViolation(format!(
                "attester {} signed up twice",
                format_field(&self.attester_id)
            )));
        }
        tx.insert_epoch(&self.attester_id, 0)?;
        info!(
            "Attester {} signed up with epoch length {}s",
            format_field(&self.attester_id),
            epoch_length
        );
        Ok(true)
    }

    fn handle_user_signed_up(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        commitment: &Field,
        leaf_index: u64,
        leaf: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;
        tx.insert_user_signup(&self.attester_id, commitment, epoch, leaf_index, block)?;
        self.append_state_tree_leaf(tx, epoch, leaf_index, leaf, block)?;
        Ok(true)
    }

    fn handle_user_state_transitioned(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        leaf_index: u64,
        hashed_leaf: &Field,
        nullifier: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;
        tx.insert_nullifier(&self.attester_id, nullifier, epoch, block)?;
        self.append_state_tree_leaf(tx, epoch, leaf_index, hashed_leaf, block)?;
        Ok(true)
    }

    fn handle_attestation(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        epoch_key: &Field,
        field_index: u64,
        change: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;

        let field_index = usize::try_from(field_index)
            .ok()
            .filter(|index| *index < self.protocol.field_count)
            .ok_or_else(|| {
                SyncError::ProtocolViolation(format!(
                    "attestation field index {} out of range ({} fields)",
                    field_index, self.protocol.field_count
                ))
            })?;

        let is_signup_grant = tx
            .user_signup(&self.attester_id, epoch_key)?
            .is_some_and(|signup| signup.epoch == epoch);

        tx.insert_attestation(&self.attester_id, epoch, epoch_key, field_index, change, block)?;
        if is_signup_grant {
            debug!("Stored sign-up grant for {}", format_field(epoch_key));
            return Ok(true);
        }

        let key = self.epoch_tree_index(epoch_key)?;
        let attestations = tx.attestations(&self.attester_id, epoch, std::slice::from_ref(epoch_key))?;
        let data = ReputationData::fold(
            &self.protocol,
            attestations.iter().map(|a| (a.field_index, &a.change)),
        );
        let leaf = gen_epoch_tree_leaf(epoch_key, data.fields());
        tx.upsert_epoch_tree_leaf(&self.attester_id, epoch, key, &leaf, block)?;
        Ok(true)
    }

    fn handle_state_tree_leaf(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        index: u64,
        leaf: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;
        self.append_state_tree_leaf(tx, epoch, index, leaf, block)?;
        Ok(true)
    }

    fn handle_epoch_tree_leaf(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        index: &Field,
        leaf: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;
        let key = self.epoch_tree_index(index)?;
        tx.upsert_epoch_tree_leaf(&self.attester_id, epoch, key, leaf, block)?;
        Ok(true)
    }

    fn handle_epoch_ended(&self, tx: &StoreTx<'_>, epoch: u64) -> Result<bool, SyncError> {
        self.require_current_epoch(tx, epoch)?;
        tx.seal_epoch(&self.attester_id, epoch)?;
        tx.insert_epoch(&self.attester_id, epoch + 1)?;
        info!(
            "Epoch {} sealed for attester {}",
            epoch,
            format_field(&self.attester_id)
        );
        Ok(true)
    }

    fn handle_history_tree_leaf(
        &self,
        tx: &StoreTx<'_>,
        leaf: &Field,
        block: u64,
    ) -> Result<bool, SyncError> {
        self.require_registered(tx)?;
        let index = tx.num_history_tree_leaves(&self.attester_id)?;
        self.check_capacity("history", index, self.protocol.history_tree_depth)?;
        tx.insert_history_tree_leaf(&self.attester_id, index, leaf, block)?;
        Ok(true)
    }

    /// Append `leaf` at `index` of an epoch's state tree.
    ///
    /// The ledger reports sign-up and transition leaves both in their own event and in a
    /// `StateTreeLeaf` event, so an exact repeat of an existing leaf is accepted as a no-op.
    fn append_state_tree_leaf(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        index: u64,
        leaf: &Field,
        block: u64,
    ) -> Result<(), SyncError> {
        let next = tx.num_state_tree_leaves(&self.attester_id, epoch)?;
        if index < next {
            return match tx.state_tree_leaf(&self.attester_id, epoch, index)? {
                Some(existing) if existing == *leaf => Ok(()),
                _ => Err(SyncError::ProtocolViolation(format!(
                    "state tree leaf {} of epoch {} reported with a different hash",
                    index, epoch
                ))),
            };
        }
        if index > next {
            return Err(SyncError::ProtocolViolation(format!(
                "state tree leaf {} of epoch {} skips ahead of index {}",
                index, epoch, next
            )));
        }
        self.check_capacity("state", index, self.protocol.state_tree_depth)?;
        tx.insert_state_tree_leaf(&self.attester_id, epoch, index, leaf, block)
    }

    fn require_registered(&self, tx: &StoreTx<'_>) -> Result<(), SyncError> {
        if tx.attester(&self.attester_id)?.is_none() {
            return Err(SyncError::ScopeNotRegistered(format_field(&self.attester_id)));
        }
        Ok(())
    }

    /// Events must target the scope's single unsealed epoch.
    fn require_current_epoch(&self, tx: &StoreTx<'_>, epoch: u64) -> Result<(), SyncError> {
        let current = tx
            .current_epoch(&self.attester_id)?
            .ok_or_else(|| SyncError::ScopeNotRegistered(format_field(&self.attester_id)))?;
        if current.number != epoch {
            return Err(SyncError::ProtocolViolation(format!(
                "event for epoch {} while epoch {} is current",
                epoch, current.number
            )));
        }
        Ok(())
    }

    fn epoch_tree_index(&self, epoch_key: &Field) -> Result<u64, SyncError> {
        let limit = 1u64 << self.protocol.epoch_tree_depth;
        u64::try_from(epoch_key)
            .ok()
            .filter(|key| *key < limit)
            .ok_or_else(|| {
                SyncError::ProtocolViolation(format!(
                    "epoch key {} outside an epoch tree of depth {}",
                    format_field(epoch_key),
                    self.protocol.epoch_tree_depth
                ))
            })
    }

    fn check_capacity(&self, tree: &str, index: u64, depth: u8) -> Result<(), SyncError> {
        if index >= 1u64 << depth {
            return Err(SyncError::ProtocolViolation(format!(
                "{} tree of depth {} is full",
                tree, depth
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::snark_scalar_field;
    use crate::sync::store::LeafStore;

    const ATTESTER: u64 = 0xa11ce;

    fn attester() -> Field {
        Field::from(ATTESTER)
    }

    fn protocol() -> ProtocolConfig {
        ProtocolConfig {
            state_tree_depth: 4,
            epoch_tree_depth: 4,
            history_tree_depth: 4,
            field_count: 4,
            sum_field_count: 2,
            repl_nonce_bits: 8,
            num_epoch_key_nonce_per_epoch: 2,
        }
    }

    fn at(block: u64) -> EventPosition {
        EventPosition {
            block_number: block,
            transaction_index: 0,
            log_index: 0,
        }
    }

    fn setup() -> (LeafStore, EventDispatcher) {
        let store = LeafStore::in_memory().unwrap();
        let dispatcher = EventDispatcher::new(attester(), protocol());
        store
            .transaction(|tx| {
                dispatcher.dispatch(
                    tx,
                    &ProtocolEvent::AttesterSignedUp {
                        attester_id: attester(),
                        epoch_length: 300,
                        timestamp: 1_000,
                    },
                    at(1),
                )
            })
            .unwrap();
        (store, dispatcher)
    }

    fn apply(store: &LeafStore, dispatcher: &EventDispatcher, event: ProtocolEvent) -> Result<bool, SyncError> {
        store.transaction(|tx| dispatcher.dispatch(tx, &event, at(2)))
    }

    fn signup(commitment: u64, leaf_index: u64) -> ProtocolEvent {
        ProtocolEvent::UserSignedUp {
            epoch: 0,
            identity_commitment: Field::from(commitment),
            attester_id: attester(),
            leaf_index,
            leaf: Field::from(commitment * 10),
        }
    }

    #[test]
    fn other_scopes_are_ignored() {
        let (store, dispatcher) = setup();
        let applied = apply(
            &store,
            &dispatcher,
            ProtocolEvent::EpochEnded {
                epoch: 0,
                attester_id: Field::from(1u8),
            },
        )
        .unwrap();
        assert!(!applied);
        let epoch = store.snapshot(|tx| tx.current_epoch(&attester())).unwrap();
        assert_eq!(epoch.map(|e| e.number), Some(0));
    }

    #[test]
    fn signups_append_state_tree_leaves_and_tolerate_echoes() {
        let (store, dispatcher) = setup();
        assert!(apply(&store, &dispatcher, signup(7, 0)).unwrap());
        assert!(apply(&store, &dispatcher, signup(8, 1)).unwrap());

        let echo = ProtocolEvent::StateTreeLeaf {
            epoch: 0,
            attester_id: attester(),
            index: 1,
            leaf: Field::from(80u8),
        };
        assert!(apply(&store, &dispatcher, echo).unwrap());

        let conflicting = ProtocolEvent::StateTreeLeaf {
            epoch: 0,
            attester_id: attester(),
            index: 1,
            leaf: Field::from(81u8),
        };
        assert!(matches!(
            apply(&store, &dispatcher, conflicting),
            Err(SyncError::ProtocolViolation(_))
        ));

        let gap = ProtocolEvent::StateTreeLeaf {
            epoch: 0,
            attester_id: attester(),
            index: 3,
            leaf: Field::from(1u8),
        };
        assert!(apply(&store, &dispatcher, gap).is_err());

        let leaves = store
            .snapshot(|tx| tx.state_tree_leaves(&attester(), 0, 0))
            .unwrap();
        assert_eq!(leaves, vec![Field::from(70u8), Field::from(80u8)]);
    }

    #[test]
    fn duplicate_signup_is_rejected() {
        let (store, dispatcher) = setup();
        apply(&store, &dispatcher, signup(7, 0)).unwrap();
        assert!(apply(&store, &dispatcher, signup(7, 1)).is_err());
    }

    #[test]
    fn attestations_fold_into_the_epoch_tree_leaf() {
        let (store, dispatcher) = setup();
        let key = Field::from(5u8);
        for change in [3u8, 4u8] {
            apply(
                &store,
                &dispatcher,
                ProtocolEvent::Attestation {
                    epoch: 0,
                    epoch_key: key.clone(),
                    attester_id: attester(),
                    field_index: 0,
                    change: Field::from(change),
                },
            )
            .unwrap();
        }

        let leaves = store.snapshot(|tx| tx.epoch_tree_leaves(&attester(), 0)).unwrap();
        let expected = gen_epoch_tree_leaf(
            &key,
            &[Field::from(7u8), Field::default(), Field::default(), Field::default()],
        );
        assert_eq!(leaves, vec![(5, expected)]);
    }

    #[test]
    fn signup_grants_stay_out_of_the_epoch_tree() {
        let (store, dispatcher) = setup();
        apply(&store, &dispatcher, signup(9, 0)).unwrap();

        // commitments are not bounded by the epoch tree depth
        let commitment = Field::from(9u8);
        apply(
            &store,
            &dispatcher,
            ProtocolEvent::Attestation {
                epoch: 0,
                epoch_key: commitment.clone(),
                attester_id: attester(),
                field_index: 0,
                change: Field::from(10u8),
            },
        )
        .unwrap();

        let (leaves, grants) = store
            .snapshot(|tx| {
                Ok((
                    tx.epoch_tree_leaves(&attester(), 0)?,
                    tx.attestations_by_epoch_key(&attester(), &commitment)?,
                ))
            })
            .unwrap();
        assert!(leaves.is_empty());
        assert_eq!(grants.len(), 1);
    }

    #[test]
    fn out_of_range_keys_and_fields_are_violations() {
        let (store, dispatcher) = setup();
        let too_large_key = ProtocolEvent::Attestation {
            epoch: 0,
            epoch_key: Field::from(16u8),
            attester_id: attester(),
            field_index: 0,
            change: Field::from(1u8),
        };
        assert!(matches!(
            apply(&store, &dispatcher, too_large_key),
            Err(SyncError::ProtocolViolation(_))
        ));

        let bad_field = ProtocolEvent::Attestation {
            epoch: 0,
            epoch_key: Field::from(1u8),
            attester_id: attester(),
            field_index: 4,
            change: Field::from(1u8),
        };
        assert!(apply(&store, &dispatcher, bad_field).is_err());

        let huge_key = ProtocolEvent::EpochTreeLeaf {
            epoch: 0,
            attester_id: attester(),
            index: snark_scalar_field().clone() - 1u32,
            leaf: Field::from(1u8),
        };
        assert!(apply(&store, &dispatcher, huge_key).is_err());

        let attestations = store
            .snapshot(|tx| tx.attestations_by_epoch_key(&attester(), &Field::from(16u8)))
            .unwrap();
        assert!(attestations.is_empty());
    }

    #[test]
    fn epoch_end_seals_and_opens_the_next_epoch() {
        let (store, dispatcher) = setup();
        apply(
            &store,
            &dispatcher,
            ProtocolEvent::EpochEnded {
                epoch: 0,
                attester_id: attester(),
            },
        )
        .unwrap();

        let (sealed, current) = store
            .snapshot(|tx| Ok((tx.epoch(&attester(), 0)?, tx.current_epoch(&attester())?)))
            .unwrap();
        assert_eq!(sealed.map(|e| e.sealed), Some(true));
        assert_eq!(current.map(|e| e.number), Some(1));

        // stale epoch events are violations once the epoch is sealed
        assert!(matches!(
            apply(&store, &dispatcher, signup(7, 0)),
            Err(SyncError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn events_before_attester_signup_are_rejected() {
        let store = LeafStore::in_memory().unwrap();
        let dispatcher = EventDispatcher::new(attester(), protocol());
        assert!(matches!(
            apply(&store, &dispatcher, signup(7, 0)),
            Err(SyncError::ScopeNotRegistered(_))
        ));
        assert!(matches!(
            apply(
                &store,
                &dispatcher,
                ProtocolEvent::HistoryTreeLeaf {
                    attester_id: attester(),
                    leaf: Field::from(1u8),
                }
            ),
            Err(SyncError::ScopeNotRegistered(_))
        ));
    }
}
