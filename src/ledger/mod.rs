//! Ledger integration module.
//!
//! This module provides the event source the synchronizer replays and the small set of
//! read-only ledger queries used to cross-check locally rebuilt roots. The ledger itself
//! is an external collaborator: all the synchronizer needs is "current block height",
//! "events in a block range" and two root queries.

/// JSON-RPC client for an EVM-style ledger node
mod client;
/// In-process ledger used by tests and local simulations
mod memory;
/// Type definitions for raw events and ledger errors
mod types;

pub use client::JsonRpcLedgerClient;
pub use memory::MemoryLedger;
pub use types::*;

use crate::merkle::Field;

/// Source of ordered protocol events plus the ledger's canonical root queries.
#[async_trait::async_trait]
pub trait LedgerEventSource: Send + Sync {
	/// Current head block number.
	async fn block_number(&self) -> Result<u64, LedgerError>;

	/// All events with `from_block <= block_number <= to_block` whose first topic is
	/// in `topics`. Order is unspecified.
	async fn get_events(
		&self,
		from_block: u64,
		to_block: u64,
		topics: &[Topic],
	) -> Result<Vec<RawEvent>, LedgerError>;

	/// Whether `root` was ever a state tree root of `epoch` for the attester.
	async fn state_tree_root_exists(
		&self,
		attester_id: &Field,
		epoch: u64,
		root: &Field,
	) -> Result<bool, LedgerError>;

	/// The ledger's epoch tree root for a sealed (or current) epoch.
	async fn epoch_tree_root(&self, attester_id: &Field, epoch: u64) -> Result<Field, LedgerError>;
}
