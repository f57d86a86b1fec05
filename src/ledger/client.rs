//!
//! JSON-RPC client for the ledger node hosting the protocol contract.
//!
//! This module provides an async client for the three things the synchronizer needs from
//! the ledger: the head block number, contract logs in a block range, and read-only contract
//! calls used to cross-check locally rebuilt Merkle roots. All methods are async and designed
//! for use with Tokio.

use super::types::*;
use super::LedgerEventSource;
use crate::merkle::{Field, to_word};
use crate::utils::parse_hex_u64;

use reqwest::Client;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Signature of the state tree root lookup on the protocol contract.
const STATE_TREE_ROOT_EXISTS_SIG: &str = "attesterStateTreeRootExists(uint160,uint48,uint256)";
/// Signature of the epoch tree root lookup on the protocol contract.
const EPOCH_TREE_ROOT_SIG: &str = "attesterEpochRoot(uint160,uint48)";

/// Ledger JSON-RPC client
pub struct JsonRpcLedgerClient {
	/// The underlying HTTP client for RPC requests.
	http_client: Client,
	/// The node's JSON-RPC endpoint.
	rpc_url: String,
	/// Address of the protocol contract whose logs are synchronized.
	contract_address: String,
	request_id: AtomicU64,
}

impl JsonRpcLedgerClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP JSON-RPC endpoint.
	/// * `contract_address` - The 0x-prefixed protocol contract address.
	pub fn new(rpc_url: String, contract_address: String) -> Result<Self, LedgerError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			contract_address,
			request_id: AtomicU64::new(1),
		})
	}

	/// Execute a JSON-RPC request and return its `result` member.
	pub async fn execute_request(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<serde_json::Value, LedgerError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.request_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		debug!("Sending {} request to {}", method, self.rpc_url);

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(LedgerError::RpcError(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let mut response_json: serde_json::Value = response.json().await?;

		if let Some(error) = response_json.get("error") {
			return Err(LedgerError::RpcError(format!("{} failed: {}", method, error)));
		}

		match response_json.get_mut("result") {
			Some(result) if !result.is_null() => Ok(result.take()),
			_ => Err(LedgerError::NoData),
		}
	}

	/// Perform a read-only contract call with 32-byte word arguments.
	async fn call(&self, signature: &str, args: &[Field]) -> Result<String, LedgerError> {
		let mut calldata = keccak256(signature.as_bytes())[..4].to_vec();
		for arg in args {
			calldata.extend_from_slice(&to_word(arg));
		}

		let result = self
			.execute_request(
				"eth_call",
				json!([
					{
						"to": self.contract_address,
						"data": format!("0x{}", hex::encode(calldata)),
					},
					"latest"
				]),
			)
			.await?;

		result
			.as_str()
			.map(str::to_string)
			.ok_or_else(|| LedgerError::InvalidResponse(format!("{signature} returned {result}")))
	}
}

#[async_trait::async_trait]
impl LedgerEventSource for JsonRpcLedgerClient {
	async fn block_number(&self) -> Result<u64, LedgerError> {
		let result = self.execute_request("eth_blockNumber", json!([])).await?;
		let quantity = result
			.as_str()
			.ok_or_else(|| LedgerError::InvalidResponse(format!("block number {result}")))?;
		parse_hex_u64(quantity).map_err(LedgerError::InvalidResponse)
	}

	async fn get_events(
		&self,
		from_block: u64,
		to_block: u64,
		topics: &[Topic],
	) -> Result<Vec<RawEvent>, LedgerError> {
		let topic_filter: Vec<String> = topics
			.iter()
			.map(|t| format!("0x{}", hex::encode(t)))
			.collect();

		let result = self
			.execute_request(
				"eth_getLogs",
				json!([{
					"fromBlock": format!("0x{:x}", from_block),
					"toBlock": format!("0x{:x}", to_block),
					"address": self.contract_address,
					"topics": [topic_filter],
				}]),
			)
			.await?;

		let logs: Vec<RpcLog> = serde_json::from_value(result)?;
		debug!(
			"Fetched {} logs for blocks {}..={}",
			logs.len(),
			from_block,
			to_block
		);

		let mut events = Vec::with_capacity(logs.len());
		for log in logs {
			if log.removed {
				warn!(
					"Skipping removed log at block {} (tx {}, log {})",
					log.block_number, log.transaction_index, log.log_index
				);
				continue;
			}
			events.push(RawEvent::try_from(log)?);
		}
		Ok(events)
	}

	async fn state_tree_root_exists(
		&self,
		attester_id: &Field,
		epoch: u64,
		root: &Field,
	) -> Result<bool, LedgerError> {
		let result = self
			.call(
				STATE_TREE_ROOT_EXISTS_SIG,
				&[attester_id.clone(), Field::from(epoch), root.clone()],
			)
			.await?;
		Ok(word_from_hex(&result)? != Field::default())
	}

	async fn epoch_tree_root(&self, attester_id: &Field, epoch: u64) -> Result<Field, LedgerError> {
		let result = self
			.call(EPOCH_TREE_ROOT_SIG, &[attester_id.clone(), Field::from(epoch)])
			.await?;
		word_from_hex(&result)
	}
}
