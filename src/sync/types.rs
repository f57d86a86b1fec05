use crate::config::ConfigError;
use crate::ledger::{EventPosition, LedgerError};
use crate::merkle::{Field, MerkleError};

/// Durable cursor of a synchronized scope.
///
/// `latest_processed` is advanced with every applied event, inside the same storage
/// transaction as the event's mutations. `latest_complete_block` is advanced once a whole
/// fetched block range has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
	pub latest_processed: Option<EventPosition>,
	/// `None` until the first block range has been completed.
	pub latest_complete_block: Option<u64>,
}

impl Checkpoint {
	/// A cursor for a scope whose first relevant block is `start_block`.
	pub fn starting_at(start_block: u64) -> Self {
		Self {
			latest_processed: None,
			latest_complete_block: start_block.checked_sub(1),
		}
	}

	/// First block that still needs fetching.
	pub fn next_block(&self) -> u64 {
		self.latest_complete_block.map_or(0, |b| b + 1)
	}
}

/// Registration of an attester scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttesterRecord {
	pub attester_id: Field,
	/// Epoch length in seconds.
	pub epoch_length: u64,
	/// Unix timestamp at which epoch 0 started.
	pub start_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRecord {
	pub number: u64,
	pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSignUpRecord {
	pub commitment: Field,
	pub epoch: u64,
	pub leaf_index: u64,
	pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRecord {
	/// Strictly increasing across the store, gives the canonical fold order.
	pub index: u64,
	pub epoch: u64,
	pub epoch_key: Field,
	pub field_index: usize,
	pub change: Field,
	pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullifierRecord {
	pub nullifier: Field,
	pub epoch: u64,
	pub block_number: u64,
}

/// Cached provable data of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStateCacheRecord {
	pub commitment: Field,
	pub latest_transitioned_epoch: u64,
	pub latest_transitioned_index: u64,
	/// Data folded over every epoch before `latest_transitioned_epoch`.
	pub data: Vec<Field>,
}

/// Error types for synchronization and leaf store access
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Ledger error: {0}")]
	LedgerError(#[from] LedgerError),

	#[error("Store error: {0}")]
	StoreError(#[from] rusqlite::Error),

	#[error("Merkle tree error: {0}")]
	MerkleError(#[from] MerkleError),

	#[error("Configuration error: {0}")]
	ConfigError(#[from] ConfigError),

	#[error("Failed to decode event at {position}: {reason}")]
	DecodeError {
		position: EventPosition,
		reason: String,
	},

	#[error("Unknown event topic 0x{topic} at {position}")]
	UnknownEvent {
		topic: String,
		position: EventPosition,
	},

	#[error("Protocol violation: {0}")]
	ProtocolViolation(String),

	#[error("Nullifier {0} already used")]
	DuplicateNullifier(String),

	#[error("{tree} root mismatch for epoch {epoch}: local {local}, ledger {ledger}")]
	RootMismatch {
		tree: &'static str,
		epoch: u64,
		local: String,
		ledger: String,
	},

	#[error("Attester scope {0} has not signed up")]
	ScopeNotRegistered(String),

	#[error("Epoch {0} not found")]
	EpochNotFound(u64),

	#[error("Epoch {requested} is beyond the current epoch {current}")]
	EpochBeyondCurrent { requested: u64, current: u64 },

	#[error("Synchronizer is already running")]
	AlreadyRunning,

	#[error("Synchronizer loop terminated: {0}")]
	LoopTerminated(String),
}

impl SyncError {
	/// Errors that the poll loop retries on its next iteration instead of stopping.
	///
	/// Only failures to reach the ledger qualify. A response that cannot be parsed is a schema
	/// mismatch and stops the loop like an unknown event does.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			SyncError::LedgerError(
				LedgerError::HttpError(_)
					| LedgerError::Unavailable(_)
					| LedgerError::NoData
					| LedgerError::RpcError(_)
			)
		)
	}
}
