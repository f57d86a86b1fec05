//! Synchronizer and protocol configuration.
//!
//! Defaults match the protocol's standard circuit parameters. A JSON file can override any
//! field and a few environment variables override the file.

use crate::merkle::{Field, MAX_TREE_DEPTH};
use crate::utils::field_from_hex;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Circuit-level protocol parameters shared by the synchronizer and the user state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
	pub state_tree_depth: u8,
	pub epoch_tree_depth: u8,
	pub history_tree_depth: u8,
	/// Total number of data fields per user.
	pub field_count: usize,
	/// The first `sum_field_count` fields are additive, the rest are replacement fields.
	pub sum_field_count: usize,
	/// Low bits of a replacement field change that hold its nonce.
	pub repl_nonce_bits: u32,
	pub num_epoch_key_nonce_per_epoch: u8,
}

impl Default for ProtocolConfig {
	fn default() -> Self {
		Self {
			state_tree_depth: 17,
			epoch_tree_depth: 17,
			history_tree_depth: 17,
			field_count: 6,
			sum_field_count: 4,
			repl_nonce_bits: 48,
			num_epoch_key_nonce_per_epoch: 3,
		}
	}
}

impl ProtocolConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (name, depth) in [
			("state_tree_depth", self.state_tree_depth),
			("epoch_tree_depth", self.epoch_tree_depth),
			("history_tree_depth", self.history_tree_depth),
		] {
			if depth == 0 || depth > MAX_TREE_DEPTH {
				return Err(ConfigError::Invalid(format!(
					"{name} must be between 1 and {MAX_TREE_DEPTH}, got {depth}"
				)));
			}
		}
		if self.sum_field_count > self.field_count {
			return Err(ConfigError::Invalid(format!(
				"sum_field_count {} exceeds field_count {}",
				self.sum_field_count, self.field_count
			)));
		}
		if self.repl_nonce_bits == 0 || self.repl_nonce_bits >= 253 {
			return Err(ConfigError::Invalid(format!(
				"repl_nonce_bits must be between 1 and 252, got {}",
				self.repl_nonce_bits
			)));
		}
		if self.num_epoch_key_nonce_per_epoch == 0 {
			return Err(ConfigError::Invalid(
				"num_epoch_key_nonce_per_epoch must be at least 1".to_string(),
			));
		}
		Ok(())
	}
}

/// Configuration for the synchronizer process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Ledger JSON-RPC endpoint.
	pub rpc_url: String,
	/// Protocol contract address.
	pub contract_address: String,
	/// Attester scope to synchronize, as hex.
	pub attester_id: String,
	/// First block that can hold protocol events (the contract deployment block).
	pub start_block: u64,
	/// Delay between polls of the ledger head, in milliseconds.
	pub poll_interval_ms: u64,
	/// Largest block range fetched in one request.
	pub max_block_range: u64,
	/// Blocks this close to the head are not yet treated as complete.
	pub confirmations: u64,
	/// Log progress every N blocks.
	pub progress_log_interval: u64,
	/// SQLite database path for the leaf store.
	pub database_path: PathBuf,
	pub protocol: ProtocolConfig,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			rpc_url: "http://localhost:8545".to_string(),
			contract_address: String::new(),
			attester_id: "0x0".to_string(),
			start_block: 0,
			poll_interval_ms: 5000,
			max_block_range: 5000,
			confirmations: 0,
			progress_log_interval: 1000,
			database_path: PathBuf::from("state_sync.db"),
			protocol: ProtocolConfig::default(),
		}
	}
}

impl SyncConfig {
	/// Load configuration from a JSON file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		let config: SyncConfig = serde_json::from_str(&content)?;
		Ok(config)
	}

	/// Apply `STATE_SYNC_*` environment overrides.
	pub fn apply_env_overrides(mut self) -> Self {
		if let Ok(url) = std::env::var("STATE_SYNC_RPC_URL") {
			self.rpc_url = url;
		}
		if let Ok(path) = std::env::var("STATE_SYNC_DATABASE") {
			self.database_path = PathBuf::from(path);
		}
		if let Ok(attester) = std::env::var("STATE_SYNC_ATTESTER_ID") {
			self.attester_id = attester;
		}
		self
	}

	pub fn attester_id(&self) -> Result<Field, ConfigError> {
		field_from_hex(&self.attester_id).map_err(ConfigError::Invalid)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		self.attester_id()?;
		if self.max_block_range == 0 {
			return Err(ConfigError::Invalid(
				"max_block_range must be at least 1".to_string(),
			));
		}
		self.protocol.validate()
	}
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}
