//! Per-identity view over the synchronized leaf store.
//!
//! A [`UserState`] never stores attestations itself. Every query re-derives the identity's epoch
//! keys and nullifiers from its secret and folds the matching rows of the leaf store, so it is
//! always consistent with whatever the synchronizer has committed. The only persisted state is
//! the `user_state` cache row, written once a transition is confirmed by its nullifier.

use crate::merkle::{Field, MerkleError, MerkleTree};
use crate::sync::{AttestationRecord, StoreTx, SyncError, Synchronizer, UserSignUpRecord, UserStateCacheRecord};
use crate::user_state::crypto::{
    Identity, gen_epoch_key, gen_history_tree_leaf, gen_nullifier, gen_state_tree_leaf,
};
use crate::user_state::data::ReputationData;
use crate::user_state::types::{
    EpochKeyInputs, StateTreeInputs, UserStateError, UserStateTransitionInputs,
};
use crate::utils::format_field;

use tracing::debug;

/// The state tree leaf of the latest confirmed transition.
struct ConfirmedLeaf {
    epoch: u64,
    index: u64,
    data: ReputationData,
}

/// Aggregated reputation of one identity within the synchronizer's attester scope.
pub struct UserState {
    sync: Synchronizer,
    identity: Identity,
}

impl UserState {
    pub fn new(sync: Synchronizer, identity: Identity) -> Self {
        Self { sync, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn commitment(&self) -> Field {
        self.identity.commitment()
    }

    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn has_signed_up(&self) -> Result<bool, UserStateError> {
        let commitment = self.commitment();
        self.read(|tx| Ok(tx.user_signup(self.sync.attester_id(), &commitment)?.is_some()))
    }

    /// The latest epoch the identity is known to have entered, by sign-up or transition.
    pub fn latest_transitioned_epoch(&self) -> Result<u64, UserStateError> {
        self.read(|tx| {
            let signup = self.signup(tx)?;
            self.latest_transitioned(tx, &signup)
        })
    }

    /// Index of the identity's leaf in the state tree of its latest transitioned epoch.
    pub fn latest_state_tree_leaf_index(&self) -> Result<u64, UserStateError> {
        Ok(self.confirmed_leaf()?.index)
    }

    /// Epoch keys the identity can use in `epoch`.
    pub fn get_epoch_keys(&self, epoch: u64) -> Result<Vec<Field>, UserStateError> {
        self.read(|tx| self.require_reachable(tx, epoch))?;
        Ok(self.epoch_keys(epoch))
    }

    /// Data accumulated from sign-up through `to_epoch`, defaulting to the current epoch.
    pub fn get_data(&self, to_epoch: Option<u64>) -> Result<ReputationData, UserStateError> {
        self.read(|tx| {
            let signup = self.signup(tx)?;
            let to_epoch = match to_epoch {
                Some(epoch) => {
                    self.require_reachable(tx, epoch)?;
                    epoch
                }
                None => self.current_epoch(tx)?,
            };
            if to_epoch < signup.epoch {
                return Err(UserStateError::NotSignedUp(format_field(&signup.commitment)));
            }
            self.data_through(tx, &signup, to_epoch)
        })
    }

    /// Data committed to by the identity's latest state tree leaf.
    pub fn get_provable_data(&self) -> Result<ReputationData, UserStateError> {
        self.read(|tx| {
            let signup = self.signup(tx)?;
            let epoch = self.latest_transitioned(tx, &signup)?;
            self.provable(tx, &signup, epoch)
        })
    }

    /// Data accumulated by a single epoch key in `epoch`.
    pub fn get_data_by_epoch_key(
        &self,
        epoch_key: &Field,
        epoch: u64,
    ) -> Result<ReputationData, UserStateError> {
        self.read(|tx| {
            self.require_reachable(tx, epoch)?;
            let attestations =
                tx.attestations(self.sync.attester_id(), epoch, std::slice::from_ref(epoch_key))?;
            Ok(self.fold(&attestations))
        })
    }

    /// Inputs proving the identity's membership in its latest state tree.
    pub fn state_tree_inputs(&self) -> Result<StateTreeInputs, UserStateError> {
        let leaf = self.confirmed_leaf()?;
        let tree = self.sync.gen_state_tree(leaf.epoch)?;
        Ok(StateTreeInputs {
            epoch: leaf.epoch,
            leaf_index: leaf.index,
            state_tree_root: tree.root(),
            state_tree_proof: tree.proof(leaf.index)?,
            data: leaf.data.into_fields(),
        })
    }

    /// Inputs for transitioning from the latest transitioned epoch into `to_epoch`.
    pub fn user_state_transition_inputs(
        &self,
        to_epoch: u64,
    ) -> Result<UserStateTransitionInputs, UserStateError> {
        let current = self.sync.current_epoch()?;
        if to_epoch > current {
            return Err(UserStateError::EpochBeyondCurrent {
                requested: to_epoch,
                current,
            });
        }

        let state_tree = self.state_tree_inputs()?;
        let from_epoch = state_tree.epoch;
        if to_epoch <= from_epoch {
            return Err(UserStateError::AlreadyTransitioned(from_epoch));
        }

        let epoch_tree = self.sync.gen_epoch_tree(from_epoch)?;
        let (key_data, new_data) = self.read(|tx| {
            let signup = self.signup(tx)?;
            let key_data = self
                .epoch_keys(from_epoch)
                .into_iter()
                .map(|key| -> Result<_, UserStateError> {
                    let attestations = tx.attestations(
                        self.sync.attester_id(),
                        from_epoch,
                        std::slice::from_ref(&key),
                    )?;
                    Ok((key, self.fold(&attestations)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let new_data = self.data_through(tx, &signup, to_epoch - 1)?;
            Ok((key_data, new_data))
        })?;

        let mut epoch_keys = Vec::with_capacity(key_data.len());
        for (nonce, (epoch_key, data)) in key_data.into_iter().enumerate() {
            let index = epoch_tree_index(&epoch_key, epoch_tree.capacity())?;
            epoch_keys.push(EpochKeyInputs {
                nonce: nonce as u8,
                epoch_tree_proof: epoch_tree.proof(index)?,
                epoch_key,
                data: data.into_fields(),
            });
        }

        let history_tree = self.sync.gen_history_tree()?;
        let history_leaf = gen_history_tree_leaf(&state_tree.state_tree_root, &epoch_tree.root());
        let history_index = history_tree
            .index_of(&history_leaf)
            .ok_or(UserStateError::HistoryLeafNotFound(from_epoch))?;

        Ok(UserStateTransitionInputs {
            from_epoch,
            to_epoch,
            nullifier: gen_nullifier(self.identity.secret(), self.sync.attester_id(), to_epoch),
            history_tree_root: history_tree.root(),
            history_tree_proof: history_tree.proof(history_index)?,
            state_tree,
            epoch_keys,
            new_data: new_data.into_fields(),
        })
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> Result<T, UserStateError>,
    ) -> Result<T, UserStateError> {
        self.sync.store().snapshot(|tx| Ok(f(tx)))?
    }

    fn signup(&self, tx: &StoreTx<'_>) -> Result<UserSignUpRecord, UserStateError> {
        let commitment = self.commitment();
        tx.user_signup(self.sync.attester_id(), &commitment)?
            .ok_or_else(|| UserStateError::NotSignedUp(format_field(&commitment)))
    }

    fn current_epoch(&self, tx: &StoreTx<'_>) -> Result<u64, UserStateError> {
        let epoch = tx.current_epoch(self.sync.attester_id())?.ok_or_else(|| {
            SyncError::ScopeNotRegistered(format_field(self.sync.attester_id()))
        })?;
        Ok(epoch.number)
    }

    fn require_reachable(&self, tx: &StoreTx<'_>, epoch: u64) -> Result<(), UserStateError> {
        let current = self.current_epoch(tx)?;
        if epoch > current {
            return Err(UserStateError::EpochBeyondCurrent {
                requested: epoch,
                current,
            });
        }
        Ok(())
    }

    /// Transitions publish `gen_nullifier(.., to_epoch)`, so the newest epoch with a used
    /// nullifier is the latest transition.
    fn latest_transitioned(
        &self,
        tx: &StoreTx<'_>,
        signup: &UserSignUpRecord,
    ) -> Result<u64, UserStateError> {
        let current = self.current_epoch(tx)?;
        let attester_id = self.sync.attester_id();
        for epoch in (signup.epoch + 1..=current).rev() {
            let nullifier = gen_nullifier(self.identity.secret(), attester_id, epoch);
            if tx.nullifier(attester_id, &nullifier)?.is_some() {
                return Ok(epoch);
            }
        }
        Ok(signup.epoch)
    }

    fn epoch_keys(&self, epoch: u64) -> Vec<Field> {
        let protocol = self.sync.protocol();
        (0..protocol.num_epoch_key_nonce_per_epoch)
            .map(|nonce| {
                gen_epoch_key(
                    self.identity.secret(),
                    self.sync.attester_id(),
                    epoch,
                    nonce,
                    protocol.epoch_tree_depth,
                )
            })
            .collect()
    }

    /// Attestations to any of the identity's keys in `epoch`, including sign-up grants.
    fn attestations_in(
        &self,
        tx: &StoreTx<'_>,
        epoch: u64,
        signup: &UserSignUpRecord,
    ) -> Result<Vec<AttestationRecord>, UserStateError> {
        let mut keys = self.epoch_keys(epoch);
        if epoch == signup.epoch {
            keys.push(signup.commitment.clone());
        }
        Ok(tx.attestations(self.sync.attester_id(), epoch, &keys)?)
    }

    fn fold(&self, attestations: &[AttestationRecord]) -> ReputationData {
        ReputationData::fold(
            self.sync.protocol(),
            attestations.iter().map(|a| (a.field_index, &a.change)),
        )
    }

    /// Fold every epoch from sign-up through `to_epoch`, resuming from the cache when it
    /// covers a prefix of that range.
    fn data_through(
        &self,
        tx: &StoreTx<'_>,
        signup: &UserSignUpRecord,
        to_epoch: u64,
    ) -> Result<ReputationData, UserStateError> {
        let protocol = self.sync.protocol();
        let cached = tx
            .user_state_cache(self.sync.attester_id(), &signup.commitment)?
            .filter(|c| {
                c.latest_transitioned_epoch > signup.epoch
                    && c.latest_transitioned_epoch <= to_epoch + 1
            });

        let (mut data, from_epoch) = match cached {
            Some(cache) => (
                ReputationData::from_fields(protocol, cache.data),
                cache.latest_transitioned_epoch,
            ),
            None => (ReputationData::new(protocol), signup.epoch),
        };
        for epoch in from_epoch..=to_epoch {
            for attestation in self.attestations_in(tx, epoch, signup)? {
                data.apply(attestation.field_index, &attestation.change);
            }
        }
        Ok(data)
    }

    /// Data provable at `epoch`: the sign-up grants in the sign-up epoch, otherwise everything
    /// before `epoch`.
    fn provable(
        &self,
        tx: &StoreTx<'_>,
        signup: &UserSignUpRecord,
        epoch: u64,
    ) -> Result<ReputationData, UserStateError> {
        if epoch == signup.epoch {
            let grants = tx.attestations(
                self.sync.attester_id(),
                epoch,
                std::slice::from_ref(&signup.commitment),
            )?;
            return Ok(self.fold(&grants));
        }
        self.data_through(tx, signup, epoch - 1)
    }

    /// Locate the latest state tree leaf and cache its data once confirmed.
    fn confirmed_leaf(&self) -> Result<ConfirmedLeaf, UserStateError> {
        let attester_id = self.sync.attester_id();
        let (leaf, newly_confirmed) = self.read(|tx| {
            let signup = self.signup(tx)?;
            let epoch = self.latest_transitioned(tx, &signup)?;
            if epoch == signup.epoch {
                let data = self.provable(tx, &signup, epoch)?;
                return Ok((
                    ConfirmedLeaf {
                        epoch,
                        index: signup.leaf_index,
                        data,
                    },
                    false,
                ));
            }

            if let Some(cache) = tx
                .user_state_cache(attester_id, &signup.commitment)?
                .filter(|c| c.latest_transitioned_epoch == epoch)
            {
                return Ok((
                    ConfirmedLeaf {
                        epoch,
                        index: cache.latest_transitioned_index,
                        data: ReputationData::from_fields(self.sync.protocol(), cache.data),
                    },
                    false,
                ));
            }

            let data = self.provable(tx, &signup, epoch)?;
            let hash = gen_state_tree_leaf(self.identity.secret(), attester_id, epoch, data.fields());
            let index = tx
                .state_tree_leaf_index(attester_id, epoch, &hash)?
                .ok_or(UserStateError::LeafNotFound(epoch))?;
            Ok((ConfirmedLeaf { epoch, index, data }, true))
        })?;

        if newly_confirmed {
            let record = UserStateCacheRecord {
                commitment: self.commitment(),
                latest_transitioned_epoch: leaf.epoch,
                latest_transitioned_index: leaf.index,
                data: leaf.data.fields().to_vec(),
            };
            self.sync
                .store()
                .transaction(|tx| tx.upsert_user_state_cache(attester_id, &record))?;
            debug!(
                "Cached user state of {} at epoch {}",
                format_field(&record.commitment),
                leaf.epoch
            );
        }
        Ok(leaf)
    }
}

fn epoch_tree_index(epoch_key: &Field, capacity: u64) -> Result<u64, MerkleError> {
    u64::try_from(epoch_key)
        .ok()
        .filter(|index| *index < capacity)
        .ok_or(MerkleError::IndexOutOfRange {
            index: u64::MAX,
            limit: capacity,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::snark_scalar_field;
    use crate::sync::LeafStore;
    use crate::sync::testing::*;
    use crate::user_state::crypto::gen_epoch_tree_leaf;

    use std::sync::Arc;

    fn f(n: u64) -> Field {
        Field::from(n)
    }

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn repl(value: u64, nonce: u64) -> Field {
        ReputationData::pack_replacement(&protocol(), &f(value), nonce)
    }

    struct Fixture {
        script: Script,
        user: UserState,
    }

    /// One identity signed up in epoch 0 with a grant of 10, then attested through its first key.
    async fn signed_up() -> Fixture {
        let mut script = Script::new();
        let store = Arc::new(LeafStore::in_memory().unwrap());
        let sync = synchronizer(store, script.ledger.clone());
        let identity = Identity::new(f(1234));
        let commitment = identity.commitment();
        let leaf = gen_state_tree_leaf(identity.secret(), &attester(), 0, &[f(10), f(0), f(0), f(0)]);

        script.at(1, 0).emit(attester_signed_up(now()));
        script.at(2, 0).emit(user_signed_up(0, &commitment, 0, &leaf));
        script.emit(attestation(0, &commitment, 0, &f(10)));

        let user = UserState::new(sync, identity);
        let key = user.epoch_keys(0)[0].clone();
        let minus_three = snark_scalar_field().clone() - 3u32;
        script.at(3, 0).emit(attestation(0, &key, 0, &f(5)));
        script.emit(attestation(0, &key, 0, &minus_three));
        script.at(3, 1).emit(attestation(0, &key, 2, &repl(7, 1)));
        script.emit(attestation(0, &key, 2, &repl(9, 0)));

        user.sync().poll_once().await.unwrap();
        Fixture { script, user }
    }

    /// Close epoch 0 the way the attester would: history leaf first, then the epoch end.
    async fn end_epoch_zero(fixture: &mut Fixture) {
        let sync = fixture.user.sync();
        let state_root = sync.gen_state_tree(0).unwrap().root();
        let epoch_root = sync.gen_epoch_tree(0).unwrap().root();
        let history_leaf = gen_history_tree_leaf(&state_root, &epoch_root);
        fixture.script.at(7, 0).emit(history_tree_leaf(&history_leaf));
        fixture.script.emit(epoch_ended(0));
        sync.poll_once().await.unwrap();
    }

    #[tokio::test]
    async fn signed_up_identity_aggregates_its_epoch_keys() {
        let fixture = signed_up().await;
        let user = &fixture.user;

        assert!(user.has_signed_up().unwrap());
        assert_eq!(user.latest_transitioned_epoch().unwrap(), 0);
        assert_eq!(user.latest_state_tree_leaf_index().unwrap(), 0);

        let data = user.get_data(None).unwrap();
        assert_eq!(data.value(0), Some(f(12)));
        assert_eq!(data.value(1), Some(f(0)));
        assert_eq!(data.value(2), Some(f(7)));
        assert_eq!(data.nonce(2), Some(1));

        assert_eq!(
            user.get_provable_data().unwrap().fields(),
            &[f(10), f(0), f(0), f(0)]
        );

        let key = user.get_epoch_keys(0).unwrap()[0].clone();
        let by_key = user.get_data_by_epoch_key(&key, 0).unwrap();
        assert_eq!(by_key.value(0), Some(f(2)));
    }

    #[tokio::test]
    async fn state_tree_inputs_prove_the_signup_leaf() {
        let fixture = signed_up().await;
        let inputs = fixture.user.state_tree_inputs().unwrap();

        assert_eq!(inputs.epoch, 0);
        assert_eq!(inputs.leaf_index, 0);
        assert_eq!(inputs.data, vec![f(10), f(0), f(0), f(0)]);
        assert!(inputs.state_tree_proof.verify());
        assert_eq!(inputs.state_tree_proof.root, inputs.state_tree_root);
    }

    #[tokio::test]
    async fn transition_moves_provable_data_forward() {
        let mut fixture = signed_up().await;
        end_epoch_zero(&mut fixture).await;
        let user = &fixture.user;
        let expected = user.get_data(Some(0)).unwrap();

        let inputs = user.user_state_transition_inputs(1).unwrap();
        assert_eq!((inputs.from_epoch, inputs.to_epoch), (0, 1));
        assert_eq!(inputs.new_data, expected.fields().to_vec());
        assert!(inputs.state_tree.state_tree_proof.verify());
        assert!(inputs.history_tree_proof.verify());
        assert_eq!(inputs.epoch_keys.len(), 2);
        for key in &inputs.epoch_keys {
            assert!(key.epoch_tree_proof.verify());
        }
        let first = &inputs.epoch_keys[0];
        assert_eq!(
            first.epoch_tree_proof.leaf,
            gen_epoch_tree_leaf(&first.epoch_key, &first.data)
        );

        let secret = user.identity().secret().clone();
        let new_leaf = gen_state_tree_leaf(&secret, &attester(), 1, &inputs.new_data);
        fixture
            .script
            .at(8, 0)
            .emit(user_state_transitioned(1, 0, &new_leaf, &inputs.nullifier));
        let next_key = user.get_epoch_keys(1).unwrap()[1].clone();
        fixture.script.at(9, 0).emit(attestation(1, &next_key, 1, &f(4)));
        user.sync().poll_once().await.unwrap();

        assert_eq!(user.latest_transitioned_epoch().unwrap(), 1);
        assert_eq!(user.latest_state_tree_leaf_index().unwrap(), 0);
        assert_eq!(user.get_provable_data().unwrap(), expected);

        let cached = user
            .sync()
            .store()
            .snapshot(|tx| tx.user_state_cache(&attester(), &user.commitment()))
            .unwrap()
            .unwrap();
        assert_eq!(cached.latest_transitioned_epoch, 1);
        assert_eq!(cached.data, expected.fields().to_vec());

        let current = user.get_data(None).unwrap();
        assert_eq!(current.value(0), Some(f(12)));
        assert_eq!(current.value(1), Some(f(4)));

        assert!(matches!(
            user.user_state_transition_inputs(1),
            Err(UserStateError::AlreadyTransitioned(1))
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_identities_and_future_epochs() {
        let fixture = signed_up().await;
        let stranger = UserState::new(fixture.user.sync().clone(), Identity::new(f(99)));

        assert!(!stranger.has_signed_up().unwrap());
        assert!(matches!(
            stranger.get_data(None),
            Err(UserStateError::NotSignedUp(_))
        ));
        assert!(matches!(
            fixture.user.get_data(Some(3)),
            Err(UserStateError::EpochBeyondCurrent {
                requested: 3,
                current: 0
            })
        ));
        assert!(matches!(
            fixture.user.get_epoch_keys(1),
            Err(UserStateError::EpochBeyondCurrent { .. })
        ));
        assert!(matches!(
            fixture.user.user_state_transition_inputs(1),
            Err(UserStateError::EpochBeyondCurrent { .. })
        ));
    }
}
