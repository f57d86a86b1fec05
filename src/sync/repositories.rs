use crate::ledger::EventPosition;
use crate::merkle::Field;
use crate::sync::types::{
	AttestationRecord, AttesterRecord, Checkpoint, EpochRecord, NullifierRecord, SyncError,
	UserSignUpRecord, UserStateCacheRecord,
};
use crate::utils::{field_from_hex, field_to_hex};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

/// Typed access to leaf store rows within one transaction or snapshot.
///
/// Every method is scoped by attester id, so independent scopes never touch each
/// other's rows.
pub struct StoreTx<'a> {
	conn: &'a Connection,
}

fn read_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<Field> {
	let text: String = row.get(idx)?;
	field_from_hex(&text)
		.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn read_attestation(row: &Row<'_>) -> rusqlite::Result<AttestationRecord> {
	Ok(AttestationRecord {
		index: row.get(0)?,
		epoch: row.get(1)?,
		epoch_key: read_field(row, 2)?,
		field_index: row.get(3)?,
		change: read_field(row, 4)?,
		block_number: row.get(5)?,
	})
}

impl<'a> StoreTx<'a> {
	pub fn new(conn: &'a Connection) -> Self {
		Self { conn }
	}

	// Checkpoint

	pub fn checkpoint(&self, attester_id: &Field) -> Result<Option<Checkpoint>, SyncError> {
		let checkpoint = self
			.conn
			.query_row(
				"SELECT latest_processed_block, latest_processed_tx_index, latest_processed_log_index, latest_complete_block
				 FROM sync_checkpoint WHERE attester_id = ?1",
				params![field_to_hex(attester_id)],
				|row| {
					let block: Option<u64> = row.get(0)?;
					let tx: Option<u64> = row.get(1)?;
					let log: Option<u64> = row.get(2)?;
					let latest_processed = match (block, tx, log) {
						(Some(block_number), Some(transaction_index), Some(log_index)) => {
							Some(EventPosition {
								block_number,
								transaction_index,
								log_index,
							})
						}
						_ => None,
					};
					Ok(Checkpoint {
						latest_processed,
						latest_complete_block: row.get(3)?,
					})
				},
			)
			.optional()?;
		Ok(checkpoint)
	}

	pub fn create_checkpoint(
		&self,
		attester_id: &Field,
		checkpoint: &Checkpoint,
	) -> Result<(), SyncError> {
		let position = checkpoint.latest_processed;
		self.conn.execute(
			"INSERT INTO sync_checkpoint
				(attester_id, latest_processed_block, latest_processed_tx_index, latest_processed_log_index, latest_complete_block)
			 VALUES (?1, ?2, ?3, ?4, ?5)",
			params![
				field_to_hex(attester_id),
				position.map(|p| p.block_number),
				position.map(|p| p.transaction_index),
				position.map(|p| p.log_index),
				checkpoint.latest_complete_block,
			],
		)?;
		Ok(())
	}

	/// Move the processed cursor forward to `position`.
	///
	/// A position at or before the stored one is rejected so the cursor never regresses.
	pub fn advance_processed_position(
		&self,
		attester_id: &Field,
		position: EventPosition,
	) -> Result<(), SyncError> {
		if let Some(current) = self
			.checkpoint(attester_id)?
			.and_then(|c| c.latest_processed)
		{
			if position <= current {
				return Err(SyncError::ProtocolViolation(format!(
					"event {} is not after checkpoint {}",
					position, current
				)));
			}
		}

		let updated = self.conn.execute(
			"UPDATE sync_checkpoint
			 SET latest_processed_block = ?2, latest_processed_tx_index = ?3, latest_processed_log_index = ?4
			 WHERE attester_id = ?1",
			params![
				field_to_hex(attester_id),
				position.block_number,
				position.transaction_index,
				position.log_index,
			],
		)?;
		if updated != 1 {
			return Err(SyncError::ScopeNotRegistered(field_to_hex(attester_id)));
		}
		Ok(())
	}

	/// Raise `latest_complete_block`; lower values are ignored.
	pub fn advance_complete_block(&self, attester_id: &Field, block: u64) -> Result<(), SyncError> {
		self.conn.execute(
			"UPDATE sync_checkpoint SET latest_complete_block = ?2
			 WHERE attester_id = ?1 AND (latest_complete_block IS NULL OR latest_complete_block < ?2)",
			params![field_to_hex(attester_id), block],
		)?;
		Ok(())
	}

	// Attester and epochs

	/// Register an attester scope; returns false if it was already registered.
	pub fn insert_attester(
		&self,
		attester_id: &Field,
		epoch_length: u64,
		start_timestamp: u64,
	) -> Result<bool, SyncError> {
		let inserted = self.conn.execute(
			"INSERT OR IGNORE INTO attester (attester_id, epoch_length, start_timestamp) VALUES (?1, ?2, ?3)",
			params![field_to_hex(attester_id), epoch_length, start_timestamp],
		)?;
		Ok(inserted == 1)
	}

	pub fn attester(&self, attester_id: &Field) -> Result<Option<AttesterRecord>, SyncError> {
		let record = self
			.conn
			.query_row(
				"SELECT epoch_length, start_timestamp FROM attester WHERE attester_id = ?1",
				params![field_to_hex(attester_id)],
				|row| {
					Ok(AttesterRecord {
						attester_id: attester_id.clone(),
						epoch_length: row.get(0)?,
						start_timestamp: row.get(1)?,
					})
				},
			)
			.optional()?;
		Ok(record)
	}

	pub fn insert_epoch(&self, attester_id: &Field, number: u64) -> Result<(), SyncError> {
		self.conn.execute(
			"INSERT INTO epoch (attester_id, number, sealed) VALUES (?1, ?2, 0)",
			params![field_to_hex(attester_id), number],
		)?;
		Ok(())
	}

	pub fn epoch(&self, attester_id: &Field, number: u64) -> Result<Option<EpochRecord>, SyncError> {
		let record = self
			.conn
			.query_row(
				"SELECT number, sealed FROM epoch WHERE attester_id = ?1 AND number = ?2",
				params![field_to_hex(attester_id), number],
				|row| {
					Ok(EpochRecord {
						number: row.get(0)?,
						sealed: row.get(1)?,
					})
				},
			)
			.optional()?;
		Ok(record)
	}

	/// The single unsealed epoch of the scope.
	pub fn current_epoch(&self, attester_id: &Field) -> Result<Option<EpochRecord>, SyncError> {
		let record = self
			.conn
			.query_row(
				"SELECT number, sealed FROM epoch WHERE attester_id = ?1 AND sealed = 0
				 ORDER BY number DESC LIMIT 1",
				params![field_to_hex(attester_id)],
				|row| {
					Ok(EpochRecord {
						number: row.get(0)?,
						sealed: row.get(1)?,
					})
				},
			)
			.optional()?;
		Ok(record)
	}

	pub fn seal_epoch(&self, attester_id: &Field, number: u64) -> Result<(), SyncError> {
		let updated = self.conn.execute(
			"UPDATE epoch SET sealed = 1 WHERE attester_id = ?1 AND number = ?2 AND sealed = 0",
			params![field_to_hex(attester_id), number],
		)?;
		if updated != 1 {
			return Err(SyncError::ProtocolViolation(format!(
				"epoch {} is not an open epoch",
				number
			)));
		}
		Ok(())
	}

	// Sign-ups

	pub fn insert_user_signup(
		&self,
		attester_id: &Field,
		commitment: &Field,
		epoch: u64,
		leaf_index: u64,
		block_number: u64,
	) -> Result<(), SyncError> {
		if self.user_signup(attester_id, commitment)?.is_some() {
			return Err(SyncError::ProtocolViolation(format!(
				"identity {} already signed up",
				field_to_hex(commitment)
			)));
		}
		self.conn.execute(
			"INSERT INTO user_signup (attester_id, commitment, epoch, leaf_index, block_number)
			 VALUES (?1, ?2, ?3, ?4, ?5)",
			params![
				field_to_hex(attester_id),
				field_to_hex(commitment),
				epoch,
				leaf_index,
				block_number
			],
		)?;
		Ok(())
	}

	pub fn user_signup(
		&self,
		attester_id: &Field,
		commitment: &Field,
	) -> Result<Option<UserSignUpRecord>, SyncError> {
		let record = self
			.conn
			.query_row(
				"SELECT epoch, leaf_index, block_number FROM user_signup
				 WHERE attester_id = ?1 AND commitment = ?2",
				params![field_to_hex(attester_id), field_to_hex(commitment)],
				|row| {
					Ok(UserSignUpRecord {
						commitment: commitment.clone(),
						epoch: row.get(0)?,
						leaf_index: row.get(1)?,
						block_number: row.get(2)?,
					})
				},
			)
			.optional()?;
		Ok(record)
	}

	// State tree leaves

	pub fn insert_state_tree_leaf(
		&self,
		attester_id: &Field,
		epoch: u64,
		index: u64,
		hash: &Field,
		block_number: u64,
	) -> Result<(), SyncError> {
		self.conn.execute(
			"INSERT INTO state_tree_leaf (attester_id, epoch, leaf_index, hash, block_number)
			 VALUES (?1, ?2, ?3, ?4, ?5)",
			params![
				field_to_hex(attester_id),
				epoch,
				index,
				field_to_hex(hash),
				block_number
			],
		)?;
		Ok(())
	}

	pub fn state_tree_leaf(
		&self,
		attester_id: &Field,
		epoch: u64,
		index: u64,
	) -> Result<Option<Field>, SyncError> {
		let leaf = self
			.conn
			.query_row(
				"SELECT hash FROM state_tree_leaf WHERE attester_id = ?1 AND epoch = ?2 AND leaf_index = ?3",
				params![field_to_hex(attester_id), epoch, index],
				|row| read_field(row, 0),
			)
			.optional()?;
		Ok(leaf)
	}

	pub fn num_state_tree_leaves(&self, attester_id: &Field, epoch: u64) -> Result<u64, SyncError> {
		let count = self.conn.query_row(
			"SELECT COUNT(*) FROM state_tree_leaf WHERE attester_id = ?1 AND epoch = ?2",
			params![field_to_hex(attester_id), epoch],
			|row| row.get(0),
		)?;
		Ok(count)
	}

	/// Leaves of an epoch's state tree with index `>= from_index`, in index order.
	pub fn state_tree_leaves(
		&self,
		attester_id: &Field,
		epoch: u64,
		from_index: u64,
	) -> Result<Vec<Field>, SyncError> {
		let mut stmt = self.conn.prepare_cached(
			"SELECT hash FROM state_tree_leaf WHERE attester_id = ?1 AND epoch = ?2 AND leaf_index >= ?3
			 ORDER BY leaf_index ASC",
		)?;
		let leaves = stmt
			.query_map(params![field_to_hex(attester_id), epoch, from_index], |row| {
				read_field(row, 0)
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(leaves)
	}

	pub fn state_tree_leaf_index(
		&self,
		attester_id: &Field,
		epoch: u64,
		hash: &Field,
	) -> Result<Option<u64>, SyncError> {
		let index = self
			.conn
			.query_row(
				"SELECT leaf_index FROM state_tree_leaf WHERE attester_id = ?1 AND epoch = ?2 AND hash = ?3
				 ORDER BY leaf_index ASC LIMIT 1",
				params![field_to_hex(attester_id), epoch, field_to_hex(hash)],
				|row| row.get(0),
			)
			.optional()?;
		Ok(index)
	}

	// Epoch tree leaves

	pub fn upsert_epoch_tree_leaf(
		&self,
		attester_id: &Field,
		epoch: u64,
		index: u64,
		leaf: &Field,
		block_number: u64,
	) -> Result<(), SyncError> {
		self.conn.execute(
			"INSERT INTO epoch_tree_leaf (attester_id, epoch, leaf_index, leaf, block_number)
			 VALUES (?1, ?2, ?3, ?4, ?5)
			 ON CONFLICT (attester_id, epoch, leaf_index)
			 DO UPDATE SET leaf = excluded.leaf, block_number = excluded.block_number",
			params![
				field_to_hex(attester_id),
				epoch,
				index,
				field_to_hex(leaf),
				block_number
			],
		)?;
		Ok(())
	}

	/// `(epoch key, leaf)` pairs of an epoch tree.
	pub fn epoch_tree_leaves(
		&self,
		attester_id: &Field,
		epoch: u64,
	) -> Result<Vec<(u64, Field)>, SyncError> {
		let mut stmt = self.conn.prepare_cached(
			"SELECT leaf_index, leaf FROM epoch_tree_leaf WHERE attester_id = ?1 AND epoch = ?2
			 ORDER BY leaf_index ASC",
		)?;
		let leaves = stmt
			.query_map(params![field_to_hex(attester_id), epoch], |row| {
				Ok((row.get(0)?, read_field(row, 1)?))
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(leaves)
	}

	// History tree leaves

	pub fn num_history_tree_leaves(&self, attester_id: &Field) -> Result<u64, SyncError> {
		let count = self.conn.query_row(
			"SELECT COUNT(*) FROM history_tree_leaf WHERE attester_id = ?1",
			params![field_to_hex(attester_id)],
			|row| row.get(0),
		)?;
		Ok(count)
	}

	pub fn insert_history_tree_leaf(
		&self,
		attester_id: &Field,
		index: u64,
		leaf: &Field,
		block_number: u64,
	) -> Result<(), SyncError> {
		self.conn.execute(
			"INSERT INTO history_tree_leaf (attester_id, leaf_index, leaf, block_number) VALUES (?1, ?2, ?3, ?4)",
			params![field_to_hex(attester_id), index, field_to_hex(leaf), block_number],
		)?;
		Ok(())
	}

	pub fn history_tree_leaves(&self, attester_id: &Field) -> Result<Vec<Field>, SyncError> {
		let mut stmt = self.conn.prepare_cached(
			"SELECT leaf FROM history_tree_leaf WHERE attester_id = ?1 ORDER BY leaf_index ASC",
		)?;
		let leaves = stmt
			.query_map(params![field_to_hex(attester_id)], |row| read_field(row, 0))?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(leaves)
	}

	// Attestations

	/// Store an attestation and return its index.
	pub fn insert_attestation(
		&self,
		attester_id: &Field,
		epoch: u64,
		epoch_key: &Field,
		field_index: usize,
		change: &Field,
		block_number: u64,
	) -> Result<u64, SyncError> {
		let index = self.conn.query_row(
			"INSERT INTO attestation (attester_id, epoch, epoch_key, field_index, change, block_number)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
			 RETURNING id",
			params![
				field_to_hex(attester_id),
				epoch,
				field_to_hex(epoch_key),
				field_index,
				field_to_hex(change),
				block_number
			],
			|row| row.get(0),
		)?;
		Ok(index)
	}

	/// Attestations made in `epoch` to any of `epoch_keys`, in index order.
	pub fn attestations(
		&self,
		attester_id: &Field,
		epoch: u64,
		epoch_keys: &[Field],
	) -> Result<Vec<AttestationRecord>, SyncError> {
		if epoch_keys.is_empty() {
			return Ok(Vec::new());
		}

		let placeholders = (0..epoch_keys.len())
			.map(|i| format!("?{}", i + 3))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = format!(
			"SELECT id, epoch, epoch_key, field_index, change, block_number FROM attestation
			 WHERE attester_id = ?1 AND epoch = ?2 AND epoch_key IN ({placeholders})
			 ORDER BY id ASC"
		);

		let mut values = vec![field_to_hex(attester_id), epoch.to_string()];
		values.extend(epoch_keys.iter().map(field_to_hex));

		let mut stmt = self.conn.prepare(&sql)?;
		let records = stmt
			.query_map(params_from_iter(values.iter()), read_attestation)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(records)
	}

	/// Every attestation ever made to `epoch_key`, in index order.
	pub fn attestations_by_epoch_key(
		&self,
		attester_id: &Field,
		epoch_key: &Field,
	) -> Result<Vec<AttestationRecord>, SyncError> {
		let mut stmt = self.conn.prepare_cached(
			"SELECT id, epoch, epoch_key, field_index, change, block_number FROM attestation
			 WHERE attester_id = ?1 AND epoch_key = ?2 ORDER BY id ASC",
		)?;
		let records = stmt
			.query_map(
				params![field_to_hex(attester_id), field_to_hex(epoch_key)],
				read_attestation,
			)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(records)
	}

	// Nullifiers

	/// Record a nullifier, rejecting one that was already used.
	pub fn insert_nullifier(
		&self,
		attester_id: &Field,
		nullifier: &Field,
		epoch: u64,
		block_number: u64,
	) -> Result<(), SyncError> {
		if self.nullifier(attester_id, nullifier)?.is_some() {
			return Err(SyncError::DuplicateNullifier(field_to_hex(nullifier)));
		}
		self.conn.execute(
			"INSERT INTO nullifier (attester_id, nullifier, epoch, block_number) VALUES (?1, ?2, ?3, ?4)",
			params![field_to_hex(attester_id), field_to_hex(nullifier), epoch, block_number],
		)?;
		Ok(())
	}

	pub fn nullifier(
		&self,
		attester_id: &Field,
		nullifier: &Field,
	) -> Result<Option<NullifierRecord>, SyncError> {
		let record = self
			.conn
			.query_row(
				"SELECT epoch, block_number FROM nullifier WHERE attester_id = ?1 AND nullifier = ?2",
				params![field_to_hex(attester_id), field_to_hex(nullifier)],
				|row| {
					Ok(NullifierRecord {
						nullifier: nullifier.clone(),
						epoch: row.get(0)?,
						block_number: row.get(1)?,
					})
				},
			)
			.optional()?;
		Ok(record)
	}

	// User state cache

	pub fn user_state_cache(
		&self,
		attester_id: &Field,
		commitment: &Field,
	) -> Result<Option<UserStateCacheRecord>, SyncError> {
		let row = self
			.conn
			.query_row(
				"SELECT latest_transitioned_epoch, latest_transitioned_index, data FROM user_state
				 WHERE attester_id = ?1 AND commitment = ?2",
				params![field_to_hex(attester_id), field_to_hex(commitment)],
				|row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?, row.get::<_, String>(2)?)),
			)
			.optional()?;

		let Some((epoch, index, data)) = row else {
			return Ok(None);
		};
		let encoded: Vec<String> = serde_json::from_str(&data).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
		})?;
		let data = encoded
			.iter()
			.map(|v| field_from_hex(v))
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

		Ok(Some(UserStateCacheRecord {
			commitment: commitment.clone(),
			latest_transitioned_epoch: epoch,
			latest_transitioned_index: index,
			data,
		}))
	}

	pub fn upsert_user_state_cache(
		&self,
		attester_id: &Field,
		record: &UserStateCacheRecord,
	) -> Result<(), SyncError> {
		let encoded: Vec<String> = record.data.iter().map(field_to_hex).collect();
		let data = serde_json::to_string(&encoded).map_err(|e| {
			rusqlite::Error::ToSqlConversionFailure(Box::new(e))
		})?;
		self.conn.execute(
			"INSERT INTO user_state
				(attester_id, commitment, latest_transitioned_epoch, latest_transitioned_index, data, updated_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
			 ON CONFLICT (attester_id, commitment) DO UPDATE SET
				latest_transitioned_epoch = excluded.latest_transitioned_epoch,
				latest_transitioned_index = excluded.latest_transitioned_index,
				data = excluded.data,
				updated_at = excluded.updated_at",
			params![
				field_to_hex(attester_id),
				field_to_hex(&record.commitment),
				record.latest_transitioned_epoch,
				record.latest_transitioned_index,
				data,
				chrono::Utc::now().timestamp(),
			],
		)?;
		Ok(())
	}
}
