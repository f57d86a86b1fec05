//! Types for ledger event ingestion

use crate::utils::{field_from_hex, parse_hex_u64};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// A 32-byte log topic.
pub type Topic = [u8; 32];

/// Keccak-256 digest, used for event topics and call selectors.
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
	Keccak256::digest(bytes).into()
}

/// Position of an event in the ledger's total order.
///
/// Field order matters: the derived `Ord` compares block, then transaction index,
/// then log index, which is exactly the order events must be applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
	pub block_number: u64,
	pub transaction_index: u64,
	pub log_index: u64,
}

impl std::fmt::Display for EventPosition {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}:{}:{}",
			self.block_number, self.transaction_index, self.log_index
		)
	}
}

/// An undecoded event as delivered by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
	pub block_number: u64,
	pub transaction_index: u64,
	pub log_index: u64,
	pub topics: Vec<Topic>,
	/// Concatenated 32-byte words of the non-indexed arguments.
	pub data: Vec<u8>,
}

impl RawEvent {
	pub fn position(&self) -> EventPosition {
		EventPosition {
			block_number: self.block_number,
			transaction_index: self.transaction_index,
			log_index: self.log_index,
		}
	}
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
	pub block_number: String,
	pub transaction_index: String,
	pub log_index: String,
	pub topics: Vec<String>,
	pub data: String,
	/// Set by the node when the log was dropped by a chain reorganization.
	#[serde(default)]
	pub removed: bool,
}

impl TryFrom<RpcLog> for RawEvent {
	type Error = LedgerError;

	fn try_from(log: RpcLog) -> Result<Self, Self::Error> {
		let topics = log
			.topics
			.iter()
			.map(|t| decode_topic(t))
			.collect::<Result<Vec<_>, _>>()?;
		let data = hex::decode(log.data.trim_start_matches("0x"))
			.map_err(|e| LedgerError::InvalidResponse(format!("bad log data: {e}")))?;

		Ok(RawEvent {
			block_number: parse_hex_u64(&log.block_number).map_err(LedgerError::InvalidResponse)?,
			transaction_index: parse_hex_u64(&log.transaction_index)
				.map_err(LedgerError::InvalidResponse)?,
			log_index: parse_hex_u64(&log.log_index).map_err(LedgerError::InvalidResponse)?,
			topics,
			data,
		})
	}
}

fn decode_topic(topic: &str) -> Result<Topic, LedgerError> {
	let bytes = hex::decode(topic.trim_start_matches("0x"))
		.map_err(|e| LedgerError::InvalidResponse(format!("bad topic {topic}: {e}")))?;
	bytes
		.try_into()
		.map_err(|_| LedgerError::InvalidResponse(format!("topic {topic} is not 32 bytes")))
}

/// Parse a 32-byte hex word returned by `eth_call`.
pub(crate) fn word_from_hex(value: &str) -> Result<crate::merkle::Field, LedgerError> {
	field_from_hex(value).map_err(LedgerError::InvalidResponse)
}

/// Error types for ledger access
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	#[error("RPC error: {0}")]
	RpcError(String),

	#[error("No data returned")]
	NoData,

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid response: {0}")]
	InvalidResponse(String),

	#[error("Ledger unavailable: {0}")]
	Unavailable(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn positions_order_by_block_then_tx_then_log() {
		let p = |b, t, l| EventPosition {
			block_number: b,
			transaction_index: t,
			log_index: l,
		};
		assert!(p(1, 9, 9) < p(2, 0, 0));
		assert!(p(2, 0, 9) < p(2, 1, 0));
		assert!(p(2, 1, 0) < p(2, 1, 1));
		assert_eq!(p(3, 4, 5).to_string(), "3:4:5");
	}

	#[test]
	fn rpc_log_converts_to_raw_event() {
		let log: RpcLog = serde_json::from_value(serde_json::json!({
			"blockNumber": "0x10",
			"transactionIndex": "0x2",
			"logIndex": "0x5",
			"topics": [format!("0x{}", "ab".repeat(32))],
			"data": "0x0001",
		}))
		.unwrap();
		assert!(!log.removed);

		let event = RawEvent::try_from(log).unwrap();
		assert_eq!(event.block_number, 16);
		assert_eq!(event.transaction_index, 2);
		assert_eq!(event.log_index, 5);
		assert_eq!(event.topics, vec![[0xab; 32]]);
		assert_eq!(event.data, vec![0, 1]);
	}

	#[test]
	fn short_topics_are_rejected() {
		let log = RpcLog {
			block_number: "0x1".into(),
			transaction_index: "0x0".into(),
			log_index: "0x0".into(),
			topics: vec!["0xabcd".into()],
			data: "0x".into(),
			removed: false,
		};
		assert!(matches!(
			RawEvent::try_from(log),
			Err(LedgerError::InvalidResponse(_))
		));
	}
}
