//! Event Synchronization Module
//!
//! This module provides the core logic for mirroring an attester scope of the protocol ledger into
//! a local leaf store. It is composed of several submodules, each responsible for one aspect of the
//! sync process:
//!
//! - `synchronizer`: The main entry point. Runs the poll loop, owns the checkpoint and exposes tree and query APIs.
//! - `events`: The closed event schema and decoding of raw ledger logs.
//! - `sequencer`: Deterministic ordering and deduplication of fetched event batches.
//! - `dispatcher`: One handler per event kind, applied inside a leaf store transaction.
//! - `store` / `repositories`: The SQLite leaf store and its typed row access.
//! - `progress_tracker`: Tracks sync progress and provides statistics.
//!
//! Every applied event and the checkpoint advance for it commit in one transaction, so a restart
//! resumes exactly after the last committed event.

/// Handlers that apply decoded events to the leaf store
pub mod dispatcher;
/// Protocol event schema and decoding
pub mod events;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Typed row access within a leaf store transaction
pub mod repositories;
/// Ordering of fetched event batches
pub mod sequencer;
/// SQLite leaf store
pub mod store;
/// Main coordinator for the sync process
pub mod synchronizer;
/// Persisted records and sync errors
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::EventDispatcher;
pub use events::{EventKind, ProtocolEvent};
pub use progress_tracker::{SyncProgressTracker, SyncStats};
pub use repositories::StoreTx;
pub use sequencer::sequence_events;
pub use store::LeafStore;
pub use synchronizer::Synchronizer;
pub use types::*;
