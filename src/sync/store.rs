//! SQLite leaf store.
//!
//! The leaf store owns every persisted row: the synchronization checkpoint, epochs,
//! sign-ups, tree leaves, attestations, nullifiers and the user-state cache. It holds no
//! business logic. All access goes through [`StoreTx`], either inside a write transaction
//! that commits atomically or inside a read snapshot.

use crate::sync::repositories::StoreTx;
use crate::sync::types::SyncError;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

const SCHEMA: &str = r#"
	CREATE TABLE IF NOT EXISTS sync_checkpoint (
		attester_id TEXT PRIMARY KEY,
		latest_processed_block INTEGER,
		latest_processed_tx_index INTEGER,
		latest_processed_log_index INTEGER,
		latest_complete_block INTEGER
	);

	CREATE TABLE IF NOT EXISTS attester (
		attester_id TEXT PRIMARY KEY,
		epoch_length INTEGER NOT NULL,
		start_timestamp INTEGER NOT NULL
	);

	CREATE TABLE IF NOT EXISTS epoch (
		attester_id TEXT NOT NULL,
		number INTEGER NOT NULL,
		sealed INTEGER NOT NULL DEFAULT 0,
		PRIMARY KEY (attester_id, number)
	);

	CREATE TABLE IF NOT EXISTS user_signup (
		attester_id TEXT NOT NULL,
		commitment TEXT NOT NULL,
		epoch INTEGER NOT NULL,
		leaf_index INTEGER NOT NULL,
		block_number INTEGER NOT NULL,
		PRIMARY KEY (attester_id, commitment)
	);

	CREATE TABLE IF NOT EXISTS state_tree_leaf (
		attester_id TEXT NOT NULL,
		epoch INTEGER NOT NULL,
		leaf_index INTEGER NOT NULL,
		hash TEXT NOT NULL,
		block_number INTEGER NOT NULL,
		PRIMARY KEY (attester_id, epoch, leaf_index)
	);
	CREATE INDEX IF NOT EXISTS idx_state_tree_leaf_hash
		ON state_tree_leaf(attester_id, epoch, hash);

	CREATE TABLE IF NOT EXISTS epoch_tree_leaf (
		attester_id TEXT NOT NULL,
		epoch INTEGER NOT NULL,
		leaf_index INTEGER NOT NULL,
		leaf TEXT NOT NULL,
		block_number INTEGER NOT NULL,
		PRIMARY KEY (attester_id, epoch, leaf_index)
	);

	CREATE TABLE IF NOT EXISTS history_tree_leaf (
		attester_id TEXT NOT NULL,
		leaf_index INTEGER NOT NULL,
		leaf TEXT NOT NULL,
		block_number INTEGER NOT NULL,
		PRIMARY KEY (attester_id, leaf_index)
	);

	CREATE TABLE IF NOT EXISTS attestation (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		attester_id TEXT NOT NULL,
		epoch INTEGER NOT NULL,
		epoch_key TEXT NOT NULL,
		field_index INTEGER NOT NULL,
		change TEXT NOT NULL,
		block_number INTEGER NOT NULL
	);
	CREATE INDEX IF NOT EXISTS idx_attestation_epoch_key
		ON attestation(attester_id, epoch, epoch_key);

	CREATE TABLE IF NOT EXISTS nullifier (
		attester_id TEXT NOT NULL,
		nullifier TEXT NOT NULL,
		epoch INTEGER NOT NULL,
		block_number INTEGER NOT NULL,
		PRIMARY KEY (attester_id, nullifier)
	);

	CREATE TABLE IF NOT EXISTS user_state (
		attester_id TEXT NOT NULL,
		commitment TEXT NOT NULL,
		latest_transitioned_epoch INTEGER NOT NULL,
		latest_transitioned_index INTEGER NOT NULL,
		data TEXT NOT NULL,
		updated_at INTEGER NOT NULL,
		PRIMARY KEY (attester_id, commitment)
	);
"#;

/// Durable key/value tables for all synchronized rows.
pub struct LeafStore {
	conn: Mutex<Connection>,
}

impl LeafStore {
	/// Open or create a leaf store at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
		let conn = Connection::open(path.as_ref())?;
		conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
		conn.pragma_update(None, "synchronous", "NORMAL")?;

		let store = Self::with_connection(conn)?;
		info!("Opened leaf store at {:?}", path.as_ref());
		Ok(store)
	}

	/// Create an in-memory store.
	pub fn in_memory() -> Result<Self, SyncError> {
		Self::with_connection(Connection::open_in_memory()?)
	}

	fn with_connection(conn: Connection) -> Result<Self, SyncError> {
		conn.execute_batch(SCHEMA)?;
		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	/// Run `f` inside one write transaction.
	///
	/// The transaction commits only if `f` returns `Ok`; any error rolls back every
	/// write made through the supplied handle.
	pub fn transaction<T, F>(&self, f: F) -> Result<T, SyncError>
	where
		F: FnOnce(&StoreTx<'_>) -> Result<T, SyncError>,
	{
		let mut conn = self.conn.lock();
		let tx = conn.transaction()?;
		let result = f(&StoreTx::new(&tx))?;
		tx.commit()?;
		Ok(result)
	}

	/// Run read-only queries against a consistent snapshot.
	pub fn snapshot<T, F>(&self, f: F) -> Result<T, SyncError>
	where
		F: FnOnce(&StoreTx<'_>) -> Result<T, SyncError>,
	{
		let mut conn = self.conn.lock();
		let tx = conn.transaction()?;
		let result = f(&StoreTx::new(&tx));
		tx.rollback()?;
		result
	}

	/// Every row of every table, rendered as text, for whole-store comparisons.
	#[cfg(test)]
	pub(crate) fn dump(&self) -> Result<Vec<String>, SyncError> {
		let conn = self.conn.lock();
		let mut rows = Vec::new();
		for table in [
			"sync_checkpoint",
			"attester",
			"epoch",
			"user_signup",
			"state_tree_leaf",
			"epoch_tree_leaf",
			"history_tree_leaf",
			"attestation",
			"nullifier",
		] {
			let mut stmt = conn.prepare(&format!("SELECT * FROM {table} ORDER BY 1, 2, 3"))?;
			let columns = stmt.column_count();
			let mut query = stmt.query([])?;
			while let Some(row) = query.next()? {
				let mut line = table.to_string();
				for i in 0..columns {
					let value: rusqlite::types::Value = row.get(i)?;
					line.push_str(&format!("|{value:?}"));
				}
				rows.push(line);
			}
		}
		Ok(rows)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::merkle::Field;

	#[test]
	fn failed_transactions_roll_back() {
		let store = LeafStore::in_memory().unwrap();
		let attester = Field::from(1u32);

		let result: Result<(), SyncError> = store.transaction(|tx| {
			tx.insert_epoch(&attester, 0)?;
			Err(SyncError::ProtocolViolation("abort".into()))
		});
		assert!(result.is_err());

		let epoch = store.snapshot(|tx| tx.epoch(&attester, 0)).unwrap();
		assert_eq!(epoch, None);
	}

	#[test]
	fn file_store_persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("leaves.db");
		let attester = Field::from(9u32);

		{
			let store = LeafStore::open(&path).unwrap();
			store.transaction(|tx| tx.insert_epoch(&attester, 3)).unwrap();
		}

		let store = LeafStore::open(&path).unwrap();
		let epoch = store.snapshot(|tx| tx.current_epoch(&attester)).unwrap();
		assert_eq!(epoch.map(|e| e.number), Some(3));
	}
}
