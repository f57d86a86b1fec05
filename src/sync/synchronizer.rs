//! Synchronizer and integration point for all sync services.
//!
//! This module defines the `Synchronizer`, which coordinates every component involved in
//! mirroring one attester scope of the ledger. Each poll iteration fetches a bounded block
//! range, sequences the batch, and applies each event in its own leaf store transaction
//! together with the checkpoint advance for that event. The whole range is then marked
//! complete in a final update.
//!
//! The synchronizer is responsible for:
//! - Loading or creating the checkpoint and resuming exactly after the last applied event
//! - Running the cooperative poll loop and the stop handshake
//! - Rebuilding state, epoch and history trees from persisted leaves
//! - Cross-checking local roots against the ledger's read queries

use crate::config::{ProtocolConfig, SyncConfig};
use crate::ledger::{LedgerEventSource, RawEvent, Topic};
use crate::merkle::{Field, IncrementalTree, MerkleTree, SparseTree};
use crate::sync::dispatcher::EventDispatcher;
use crate::sync::events::{EventKind, ProtocolEvent};
use crate::sync::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::sync::repositories::StoreTx;
use crate::sync::sequencer::sequence_events;
use crate::sync::store::LeafStore;
use crate::sync::types::{AttestationRecord, AttesterRecord, Checkpoint, SyncError};
use crate::utils::{field_to_hex, format_field};

use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cached state tree of one epoch, extended from the store as leaves arrive.
struct StateTreeCache {
    epoch: u64,
    tree: IncrementalTree,
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), SyncError>>,
}

struct SyncInner {
    store: Arc<LeafStore>,
    ledger: Arc<dyn LedgerEventSource>,
    config: SyncConfig,
    attester_id: Field,
    dispatcher: EventDispatcher,
    topics: Vec<Topic>,
    state_tree_cache: Mutex<Option<StateTreeCache>>,
    progress: Mutex<SyncProgressTracker>,
}

/// Mirrors one attester scope of the ledger into a [`LeafStore`].
///
/// Cloning is cheap and every clone controls the same poll loop.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SyncInner>,
    running: Arc<Mutex<Option<RunningLoop>>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<LeafStore>,
        ledger: Arc<dyn LedgerEventSource>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let attester_id = config.attester_id()?;
        let dispatcher = EventDispatcher::new(attester_id.clone(), config.protocol.clone());
        let progress = SyncProgressTracker::new(config.start_block, config.progress_log_interval);

        Ok(Self {
            inner: Arc::new(SyncInner {
                store,
                ledger,
                attester_id,
                dispatcher,
                topics: EventKind::all_topics(),
                state_tree_cache: Mutex::new(None),
                progress: Mutex::new(progress),
                config,
            }),
            running: Arc::new(Mutex::new(None)),
        })
    }

    pub fn attester_id(&self) -> &Field {
        &self.inner.attester_id
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.inner.config.protocol
    }

    pub fn store(&self) -> &Arc<LeafStore> {
        &self.inner.store
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerEventSource> {
        &self.inner.ledger
    }

    /// Start the poll loop.
    ///
    /// Loads or creates the checkpoint and warms the state tree cache for the current
    /// epoch before spawning the loop onto the tokio runtime.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SyncError::AlreadyRunning);
        }

        let checkpoint = self.inner.load_checkpoint()?;
        if let Some(epoch) = self
            .inner
            .store
            .snapshot(|tx| tx.current_epoch(&self.inner.attester_id))?
        {
            let tree = self.inner.state_tree(epoch.number)?;
            debug!(
                "Warmed state tree of epoch {} with {} leaves",
                epoch.number,
                tree.len()
            );
        }

        info!(
            "Starting synchronizer for attester {} at block {}",
            format_field(&self.inner.attester_id),
            checkpoint.next_block()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(SyncInner::run(self.inner.clone(), stop_rx));
        *running = Some(RunningLoop { stop_tx, handle });
        Ok(())
    }

    /// Signal the poll loop to stop and wait for it to finish.
    ///
    /// An event being applied when the signal arrives is committed first. Returns the error
    /// that terminated the loop, if it ended on its own.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        // the loop may already have exited on a fatal error
        let _ = running.stop_tx.send(true);
        let result = match running.handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::LoopTerminated(e.to_string())),
        };
        info!("{}", self.progress().summary());
        result
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one sync pass up to the current ledger head without the background loop.
    ///
    /// Returns the number of events that mutated this scope.
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        self.inner.sync_pass(&|| false).await
    }

    /// Apply one raw event and advance the checkpoint in the same transaction.
    pub fn apply_event(&self, raw: &RawEvent) -> Result<bool, SyncError> {
        self.inner.load_checkpoint()?;
        self.inner.apply_event(raw)
    }

    /// Wait until every block up to `target_block` is complete.
    ///
    /// Without a target, waits for the ledger head observed at call time, minus the
    /// configured confirmations.
    pub async fn wait_for_sync(&self, target_block: Option<u64>) -> Result<(), SyncError> {
        let target = match target_block {
            Some(block) => block,
            None => self
                .inner
                .ledger
                .block_number()
                .await?
                .saturating_sub(self.inner.config.confirmations),
        };

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(self.inner.config.poll_interval())
            .with_max_elapsed_time(None)
            .build();

        backoff::future::retry(backoff, || async {
            let complete = self
                .checkpoint()
                .map_err(|e| backoff::Error::permanent(Some(e)))?
                .and_then(|c| c.latest_complete_block);
            if complete.is_some_and(|b| b >= target) {
                return Ok(());
            }
            if !self.is_running() {
                return Err(backoff::Error::permanent(Some(SyncError::LoopTerminated(
                    format!("stopped before reaching block {}", target),
                ))));
            }
            Err(backoff::Error::transient(None))
        })
        .await
        .map_err(|e: Option<SyncError>| {
            e.unwrap_or_else(|| SyncError::LoopTerminated("wait aborted".to_string()))
        })
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, SyncError> {
        self.inner
            .store
            .snapshot(|tx| tx.checkpoint(&self.inner.attester_id))
    }

    pub fn progress(&self) -> SyncStats {
        self.inner.progress.lock().get_stats()
    }

    pub fn attester(&self) -> Result<AttesterRecord, SyncError> {
        self.inner.store.snapshot(|tx| self.inner.require_attester(tx))
    }

    /// The scope's unsealed epoch as known from applied events.
    pub fn current_epoch(&self) -> Result<u64, SyncError> {
        self.inner.store.snapshot(|tx| self.inner.current_epoch(tx))
    }

    /// The epoch the wall clock is in, from the attester's start time and epoch length.
    pub fn calc_current_epoch(&self) -> Result<u64, SyncError> {
        let attester = self.attester()?;
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        if attester.epoch_length == 0 {
            return Ok(0);
        }
        Ok(now.saturating_sub(attester.start_timestamp) / attester.epoch_length)
    }

    pub fn num_state_tree_leaves(&self, epoch: u64) -> Result<u64, SyncError> {
        self.inner.store.snapshot(|tx| {
            self.inner.require_known_epoch(tx, epoch)?;
            tx.num_state_tree_leaves(&self.inner.attester_id, epoch)
        })
    }

    /// Rebuild the state tree of `epoch` from its persisted leaves.
    pub fn gen_state_tree(&self, epoch: u64) -> Result<IncrementalTree, SyncError> {
        self.inner.state_tree(epoch)
    }

    /// Rebuild the epoch tree of `epoch` from its persisted leaves.
    pub fn gen_epoch_tree(&self, epoch: u64) -> Result<SparseTree, SyncError> {
        let leaves = self.inner.store.snapshot(|tx| {
            self.inner.require_known_epoch(tx, epoch)?;
            tx.epoch_tree_leaves(&self.inner.attester_id, epoch)
        })?;
        let mut tree = SparseTree::new(self.protocol().epoch_tree_depth, Field::default())?;
        for (key, leaf) in leaves {
            tree.update(key, leaf)?;
        }
        Ok(tree)
    }

    pub fn gen_history_tree(&self) -> Result<IncrementalTree, SyncError> {
        let leaves = self.inner.store.snapshot(|tx| {
            self.inner.require_attester(tx)?;
            tx.history_tree_leaves(&self.inner.attester_id)
        })?;
        Ok(IncrementalTree::from_leaves(
            self.protocol().history_tree_depth,
            Field::default(),
            leaves,
        )?)
    }

    pub fn epoch_tree_root(&self, epoch: u64) -> Result<Field, SyncError> {
        Ok(self.gen_epoch_tree(epoch)?.root())
    }

    /// Whether `root` was a root of the local state tree of `epoch` at any leaf count.
    pub fn state_tree_root_exists(&self, epoch: u64, root: &Field) -> Result<bool, SyncError> {
        let leaves = self.gen_state_tree(epoch)?.leaves().to_vec();
        let mut tree = IncrementalTree::new(self.protocol().state_tree_depth, Field::default())?;
        if tree.root() == *root {
            return Ok(true);
        }
        for leaf in leaves {
            tree.insert(leaf)?;
            if tree.root() == *root {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check `root` locally and on the ledger; the two answers must agree.
    pub async fn verify_state_tree_root(&self, epoch: u64, root: &Field) -> Result<bool, SyncError> {
        let local = self.state_tree_root_exists(epoch, root)?;
        let ledger = self
            .inner
            .ledger
            .state_tree_root_exists(&self.inner.attester_id, epoch, root)
            .await?;
        if local != ledger {
            return Err(SyncError::RootMismatch {
                tree: "state",
                epoch,
                local: format!("{} exists: {}", field_to_hex(root), local),
                ledger: format!("{} exists: {}", field_to_hex(root), ledger),
            });
        }
        Ok(local)
    }

    /// Compare the local epoch tree root of `epoch` with the ledger's.
    pub async fn verify_epoch_tree_root(&self, epoch: u64) -> Result<Field, SyncError> {
        let local = self.epoch_tree_root(epoch)?;
        let ledger = self
            .inner
            .ledger
            .epoch_tree_root(&self.inner.attester_id, epoch)
            .await?;
        if local != ledger {
            return Err(SyncError::RootMismatch {
                tree: "epoch",
                epoch,
                local: field_to_hex(&local),
                ledger: field_to_hex(&ledger),
            });
        }
        Ok(local)
    }

    pub fn nullifier_exists(&self, nullifier: &Field) -> Result<bool, SyncError> {
        let record = self
            .inner
            .store
            .snapshot(|tx| tx.nullifier(&self.inner.attester_id, nullifier))?;
        Ok(record.is_some())
    }

    /// Every attestation made to `epoch_key`, in index order.
    pub fn get_attestations(&self, epoch_key: &Field) -> Result<Vec<AttestationRecord>, SyncError> {
        self.inner
            .store
            .snapshot(|tx| tx.attestations_by_epoch_key(&self.inner.attester_id, epoch_key))
    }
}

impl SyncInner {
    async fn run(inner: Arc<SyncInner>, mut stop_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let stop_requested = || *stop_rx.borrow();
            match inner.sync_pass(&stop_requested).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("Ledger unavailable, retrying next poll: {}", e);
                }
                Err(e) => {
                    error!("Synchronizer stopped: {}", e);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(inner.config.poll_interval()) => {}
                _ = stop_rx.changed() => {}
            }
        }

        debug!("Poll loop for {} stopped", format_field(&inner.attester_id));
        Ok(())
    }

    /// Fetch and apply every block range up to the confirmed head.
    async fn sync_pass(&self, stop_requested: &(dyn Fn() -> bool + Sync)) -> Result<usize, SyncError> {
        let mut checkpoint = self.load_checkpoint()?;
        let head = self.ledger.block_number().await?;
        let target = head.saturating_sub(self.config.confirmations);
        let mut applied = 0;

        while checkpoint.next_block() <= target {
            let from = checkpoint.next_block();
            let to = target.min(from.saturating_add(self.config.max_block_range - 1));

            let fetched = self.ledger.get_events(from, to, &self.topics).await?;
            let ordered = sequence_events(fetched, checkpoint.latest_processed)?;
            debug!("Applying {} events from blocks {}..={}", ordered.len(), from, to);

            for event in &ordered {
                if stop_requested() {
                    return Ok(applied);
                }
                if self.apply_event(event)? {
                    applied += 1;
                }
            }

            self.store
                .transaction(|tx| tx.advance_complete_block(&self.attester_id, to))?;
            {
                let mut progress = self.progress.lock();
                progress.record_range(to);
                progress.log_progress(false);
            }

            checkpoint = self.load_checkpoint()?;
            if stop_requested() {
                break;
            }
        }
        Ok(applied)
    }

    fn apply_event(&self, raw: &RawEvent) -> Result<bool, SyncError> {
        let position = raw.position();
        let event = ProtocolEvent::decode(raw)?;
        let applied = self.store.transaction(|tx| {
            let applied = self.dispatcher.dispatch(tx, &event, position)?;
            tx.advance_processed_position(&self.attester_id, position)?;
            Ok(applied)
        })?;
        self.progress.lock().record_event(position, applied);
        Ok(applied)
    }

    fn load_checkpoint(&self) -> Result<Checkpoint, SyncError> {
        self.store.transaction(|tx| {
            if let Some(checkpoint) = tx.checkpoint(&self.attester_id)? {
                return Ok(checkpoint);
            }
            let checkpoint = Checkpoint::starting_at(self.config.start_block);
            tx.create_checkpoint(&self.attester_id, &checkpoint)?;
            Ok(checkpoint)
        })
    }

    fn state_tree(&self, epoch: u64) -> Result<IncrementalTree, SyncError> {
        self.store.snapshot(|tx| {
            self.require_known_epoch(tx, epoch)?;
            let count = tx.num_state_tree_leaves(&self.attester_id, epoch)?;
            let mut cache = self.state_tree_cache.lock();

            if let Some(cached) = cache
                .as_mut()
                .filter(|cached| cached.epoch == epoch && cached.tree.len() <= count)
            {
                let from = cached.tree.len();
                for leaf in tx.state_tree_leaves(&self.attester_id, epoch, from)? {
                    cached.tree.insert(leaf)?;
                }
                return Ok(cached.tree.clone());
            }

            let leaves = tx.state_tree_leaves(&self.attester_id, epoch, 0)?;
            let tree = IncrementalTree::from_leaves(
                self.config.protocol.state_tree_depth,
                Field::default(),
                leaves,
            )?;
            *cache = Some(StateTreeCache {
                epoch,
                tree: tree.clone(),
            });
            Ok(tree)
        })
    }

    fn require_attester(&self, tx: &StoreTx<'_>) -> Result<AttesterRecord, SyncError> {
        tx.attester(&self.attester_id)?
            .ok_or_else(|| SyncError::ScopeNotRegistered(format_field(&self.attester_id)))
    }

    fn current_epoch(&self, tx: &StoreTx<'_>) -> Result<u64, SyncError> {
        tx.current_epoch(&self.attester_id)?
            .map(|e| e.number)
            .ok_or_else(|| SyncError::ScopeNotRegistered(format_field(&self.attester_id)))
    }

    fn require_known_epoch(&self, tx: &StoreTx<'_>, epoch: u64) -> Result<(), SyncError> {
        if tx.epoch(&self.attester_id, epoch)?.is_some() {
            return Ok(());
        }
        let current = self.current_epoch(tx)?;
        if epoch > current {
            return Err(SyncError::EpochBeyondCurrent {
                requested: epoch,
                current,
            });
        }
        Err(SyncError::EpochNotFound(epoch))
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("attester_id", &format_field(&self.inner.attester_id))
            .field("running", &self.is_running())
            .finish()
    }
}
