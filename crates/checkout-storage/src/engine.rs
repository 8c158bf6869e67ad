//! Table engine shared by the in-process storage backends.
//!
//! All tables live behind one async mutex. A unit of work owns the mutex from
//! `begin` until it commits, rolls back or is dropped, so units are serialized
//! and every read inside a unit is already exclusive. Writes are applied in
//! place and recorded in an undo log that restores the previous row images on
//! rollback.

use crate::{StorageError, UnitOfWork};
use async_trait::async_trait;
use checkout_types::{Clock, StorageTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Row {
	pub value: Vec<u8>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

impl Row {
	fn is_live(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_none_or(|at| now < at)
	}
}

pub(crate) type TableRows = BTreeMap<String, Row>;

#[derive(Debug, Default)]
pub(crate) struct Tables {
	rows: HashMap<StorageTable, TableRows>,
	sequences: HashMap<StorageTable, u64>,
	/// Tables that ever held a row with a TTL. Only these are swept by cleanup.
	ttl_tables: BTreeSet<StorageTable>,
}

impl Tables {
	/// Builds tables from previously persisted rows.
	///
	/// Sequences resume after the highest numeric key of each table.
	pub fn from_rows(rows: HashMap<StorageTable, TableRows>) -> Self {
		let sequences = rows
			.iter()
			.filter_map(|(table, rows)| {
				rows.keys()
					.filter_map(|k| k.parse::<u64>().ok())
					.max()
					.map(|max| (*table, max))
			})
			.collect();
		let ttl_tables = rows
			.iter()
			.filter(|(_, rows)| rows.values().any(|row| row.expires_at.is_some()))
			.map(|(table, _)| *table)
			.collect();
		Self {
			rows,
			sequences,
			ttl_tables,
		}
	}

	/// Every table with at least one row, keyed by table.
	pub fn rows(&self) -> &HashMap<StorageTable, TableRows> {
		&self.rows
	}

	fn table(&mut self, table: StorageTable) -> &mut TableRows {
		self.rows.entry(table).or_default()
	}
}

/// Final image of one row changed by a unit; `None` means removed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
	pub table: StorageTable,
	pub key: String,
	pub row: Option<Row>,
}

/// Receives every change of a unit, before the commit is acknowledged.
///
/// A unit commits only if `persist` succeeds; on error its changes are undone.
/// `tables` already reflects the changes.
#[async_trait]
pub(crate) trait CommitSink: Send + Sync {
	async fn persist(&self, changes: &[Change], tables: &Tables) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub(crate) struct Engine {
	tables: Arc<Mutex<Tables>>,
	clock: Arc<dyn Clock>,
	sink: Option<Arc<dyn CommitSink>>,
}

impl Engine {
	pub fn new(tables: Tables, clock: Arc<dyn Clock>, sink: Option<Arc<dyn CommitSink>>) -> Self {
		Self {
			tables: Arc::new(Mutex::new(tables)),
			clock,
			sink,
		}
	}

	pub async fn begin(&self) -> EngineUnit {
		EngineUnit {
			guard: Some(self.tables.clone().lock_owned().await),
			undo: Vec::new(),
			clock: self.clock.clone(),
			sink: self.sink.clone(),
		}
	}

	/// Physically removes rows whose TTL elapsed.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut unit = self.begin().await;
		let now = unit.clock.now();
		let mut removed = 0;
		let tables: Vec<StorageTable> = unit.tables()?.ttl_tables.iter().copied().collect();
		for table in tables {
			let expired: Vec<String> = unit
				.tables()?
				.table(table)
				.iter()
				.filter(|(_, row)| !row.is_live(now))
				.map(|(key, _)| key.clone())
				.collect();
			for key in expired {
				unit.write(table, &key, None)?;
				removed += 1;
			}
		}
		unit.commit().await?;
		Ok(removed)
	}
}

struct Undo {
	table: StorageTable,
	key: String,
	previous: Option<Row>,
}

/// Unit of work over the engine's tables.
pub(crate) struct EngineUnit {
	/// `None` once the unit has committed or rolled back.
	guard: Option<OwnedMutexGuard<Tables>>,
	undo: Vec<Undo>,
	clock: Arc<dyn Clock>,
	sink: Option<Arc<dyn CommitSink>>,
}

impl EngineUnit {
	fn tables(&mut self) -> Result<&mut Tables, StorageError> {
		self.guard
			.as_deref_mut()
			.ok_or_else(|| StorageError::Backend("unit of work already finished".into()))
	}

	fn live_row(&mut self, table: StorageTable, key: &str) -> Result<Option<&Row>, StorageError> {
		let now = self.clock.now();
		Ok(self
			.tables()?
			.table(table)
			.get(key)
			.filter(|row| row.is_live(now)))
	}

	/// Writes (or removes, with `None`) a row, remembering the previous image.
	fn write(&mut self, table: StorageTable, key: &str, row: Option<Row>) -> Result<(), StorageError> {
		let tables = self.tables()?;
		if row.as_ref().is_some_and(|row| row.expires_at.is_some()) {
			tables.ttl_tables.insert(table);
		}
		let rows = tables.table(table);
		let previous = match row {
			Some(row) => rows.insert(key.to_string(), row),
			None => rows.remove(key),
		};
		self.undo.push(Undo {
			table,
			key: key.to_string(),
			previous,
		});
		Ok(())
	}

	fn undo_all(&mut self) {
		let undo = std::mem::take(&mut self.undo);
		if let Some(tables) = self.guard.as_deref_mut() {
			for entry in undo.into_iter().rev() {
				let rows = tables.table(entry.table);
				match entry.previous {
					Some(row) => {
						rows.insert(entry.key, row);
					},
					None => {
						rows.remove(&entry.key);
					},
				}
			}
		}
	}

	/// Final images of every row this unit touched, in table and key order.
	fn changes(&mut self) -> Result<Vec<Change>, StorageError> {
		let touched: BTreeSet<(StorageTable, String)> = self
			.undo
			.iter()
			.map(|entry| (entry.table, entry.key.clone()))
			.collect();
		let tables = self.tables()?;
		Ok(touched
			.into_iter()
			.map(|(table, key)| {
				let row = tables.table(table).get(&key).cloned();
				Change { table, key, row }
			})
			.collect())
	}

	fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
		let ttl = ttl.filter(|ttl| !ttl.is_zero())?;
		// A TTL too large to represent never expires.
		let ttl = chrono::Duration::from_std(ttl).ok()?;
		self.clock.now().checked_add_signed(ttl)
	}
}

#[async_trait]
impl UnitOfWork for EngineUnit {
	async fn get(&mut self, table: StorageTable, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		Ok(self.live_row(table, key)?.map(|row| row.value.clone()))
	}

	async fn lock(
		&mut self,
		table: StorageTable,
		key: &str,
	) -> Result<Option<Vec<u8>>, StorageError> {
		// Units are serialized, so a plain read is already exclusive.
		self.get(table, key).await
	}

	async fn insert(
		&mut self,
		table: StorageTable,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		if self.live_row(table, key)?.is_some() {
			return Err(StorageError::Duplicate {
				table,
				key: key.to_string(),
			});
		}
		let expires_at = self.expiry(ttl);
		self.write(table, key, Some(Row { value, expires_at }))
	}

	async fn compare_and_swap(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<u64, StorageError> {
		let expires_at = match self.live_row(table, key)? {
			Some(row) if row.value == expected => row.expires_at,
			_ => return Ok(0),
		};
		self.write(table, key, Some(Row { value, expires_at }))?;
		Ok(1)
	}

	async fn compare_and_delete(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
	) -> Result<u64, StorageError> {
		match self.live_row(table, key)? {
			Some(row) if row.value == expected => {},
			_ => return Ok(0),
		}
		self.write(table, key, None)?;
		Ok(1)
	}

	async fn delete(&mut self, table: StorageTable, key: &str) -> Result<u64, StorageError> {
		if self.live_row(table, key)?.is_none() {
			return Ok(0);
		}
		self.write(table, key, None)?;
		Ok(1)
	}

	async fn scan(
		&mut self,
		table: StorageTable,
		start_after: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		let now = self.clock.now();
		let lower = match start_after {
			Some(key) => Bound::Excluded(key.to_string()),
			None => Bound::Unbounded,
		};
		Ok(self
			.tables()?
			.table(table)
			.range::<String, _>((lower, Bound::Unbounded))
			.filter(|(_, row)| row.is_live(now))
			.take(limit)
			.map(|(key, row)| (key.clone(), row.value.clone()))
			.collect())
	}

	async fn next_sequence(&mut self, table: StorageTable) -> Result<u64, StorageError> {
		let sequence = self.tables()?.sequences.entry(table).or_insert(0);
		*sequence += 1;
		Ok(*sequence)
	}

	async fn commit(&mut self) -> Result<(), StorageError> {
		if let Some(sink) = self.sink.clone() {
			if !self.undo.is_empty() {
				let persisted = match self.changes() {
					Ok(changes) => sink.persist(&changes, self.tables()?).await,
					Err(e) => Err(e),
				};
				if let Err(e) = persisted {
					self.undo_all();
					self.guard = None;
					return Err(e);
				}
			}
		}
		self.undo.clear();
		self.guard = None;
		Ok(())
	}

	async fn rollback(&mut self) -> Result<(), StorageError> {
		self.undo_all();
		self.guard = None;
		Ok(())
	}
}

impl Drop for EngineUnit {
	fn drop(&mut self) {
		if self.guard.is_some() && !self.undo.is_empty() {
			tracing::debug!(changes = self.undo.len(), "Rolling back abandoned unit of work");
			self.undo_all();
		}
	}
}
