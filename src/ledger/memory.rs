//! In-process ledger holding scripted events and canonical roots.

use super::types::*;
use super::LedgerEventSource;
use crate::merkle::Field;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct MemoryLedgerState {
	block_number: u64,
	events: Vec<RawEvent>,
	state_tree_roots: HashSet<(Field, u64, Field)>,
	epoch_tree_roots: HashMap<(Field, u64), Field>,
	outage: Option<String>,
}

/// A ledger that lives in memory.
///
/// Events are returned in insertion order, which need not be ledger order, so consumers
/// must sequence them. An outage can be injected to exercise transient-failure handling.
#[derive(Default)]
pub struct MemoryLedger {
	state: Mutex<MemoryLedgerState>,
}

impl MemoryLedger {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record an event; the head advances to at least the event's block.
	pub fn push_event(&self, event: RawEvent) {
		let mut state = self.state.lock();
		state.block_number = state.block_number.max(event.block_number);
		state.events.push(event);
	}

	/// Make every call fail with `LedgerError::Unavailable` until cleared.
	pub fn set_outage(&self, reason: Option<&str>) {
		self.state.lock().outage = reason.map(str::to_string);
	}

	pub fn add_state_tree_root(&self, attester_id: &Field, epoch: u64, root: Field) {
		self.state
			.lock()
			.state_tree_roots
			.insert((attester_id.clone(), epoch, root));
	}

	pub fn set_epoch_tree_root(&self, attester_id: &Field, epoch: u64, root: Field) {
		self.state
			.lock()
			.epoch_tree_roots
			.insert((attester_id.clone(), epoch), root);
	}

	pub fn events(&self) -> Vec<RawEvent> {
		self.state.lock().events.clone()
	}

	fn check_available(state: &MemoryLedgerState) -> Result<(), LedgerError> {
		match &state.outage {
			Some(reason) => Err(LedgerError::Unavailable(reason.clone())),
			None => Ok(()),
		}
	}
}

#[async_trait::async_trait]
impl LedgerEventSource for MemoryLedger {
	async fn block_number(&self) -> Result<u64, LedgerError> {
		let state = self.state.lock();
		Self::check_available(&state)?;
		Ok(state.block_number)
	}

	async fn get_events(
		&self,
		from_block: u64,
		to_block: u64,
		topics: &[Topic],
	) -> Result<Vec<RawEvent>, LedgerError> {
		let state = self.state.lock();
		Self::check_available(&state)?;
		Ok(state
			.events
			.iter()
			.filter(|e| e.block_number >= from_block && e.block_number <= to_block)
			.filter(|e| e.topics.first().is_some_and(|t| topics.contains(t)))
			.cloned()
			.collect())
	}

	async fn state_tree_root_exists(
		&self,
		attester_id: &Field,
		epoch: u64,
		root: &Field,
	) -> Result<bool, LedgerError> {
		let state = self.state.lock();
		Self::check_available(&state)?;
		Ok(state
			.state_tree_roots
			.contains(&(attester_id.clone(), epoch, root.clone())))
	}

	async fn epoch_tree_root(&self, attester_id: &Field, epoch: u64) -> Result<Field, LedgerError> {
		let state = self.state.lock();
		Self::check_available(&state)?;
		Ok(state
			.epoch_tree_roots
			.get(&(attester_id.clone(), epoch))
			.cloned()
			.unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn event(block: u64, topic: u8) -> RawEvent {
		RawEvent {
			block_number: block,
			transaction_index: 0,
			log_index: 0,
			topics: vec![[topic; 32]],
			data: Vec::new(),
		}
	}

	#[tokio::test]
	async fn filters_by_range_and_topic() {
		let ledger = MemoryLedger::new();
		for raw in [event(1, 1), event(2, 2), event(3, 1), event(5, 1)] {
			ledger.push_event(raw);
		}
		assert_eq!(ledger.block_number().await.unwrap(), 5);

		let events = ledger.get_events(2, 4, &[[1; 32]]).await.unwrap();
		assert_eq!(events, vec![event(3, 1)]);
	}

	#[tokio::test]
	async fn outage_fails_every_call() {
		let ledger = MemoryLedger::new();
		ledger.set_outage(Some("node down"));
		assert!(matches!(
			ledger.block_number().await,
			Err(LedgerError::Unavailable(_))
		));
		ledger.set_outage(None);
		assert_eq!(ledger.block_number().await.unwrap(), 0);
	}
}
