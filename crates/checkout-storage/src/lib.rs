//! Storage module for the checkout system.
//!
//! This module defines the storage port every component writes through. A
//! backend offers atomic units of work with three primitives the coordination
//! protocol is built on: unique inserts that fail distinctly on a duplicate key,
//! conditional updates that report how many rows they affected, and exclusive
//! row reads held until the unit ends.
//!
//! [`StorageService`] and [`Transaction`] layer typed, serde-based access on
//! top of the byte-level [`StorageInterface`] and [`UnitOfWork`] traits.

use async_trait::async_trait;
use checkout_types::{Clock, ConfigSchema, ImplementationRegistry, StorageTable};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod engine;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Number of rows fetched per page when a transaction scans a table.
const SCAN_PAGE: usize = 256;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// A unique insert collided with a live row.
	#[error("Duplicate key '{key}' in {table}")]
	Duplicate { table: StorageTable, key: String },
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl StorageError {
	/// Whether this error is the unique-insert collision signal.
	pub fn is_duplicate(&self) -> bool {
		matches!(self, StorageError::Duplicate { .. })
	}
}

/// One atomic unit of work against a storage backend.
///
/// Nothing done through a unit is visible to other units until `commit`
/// returns. `rollback`, or dropping the unit without committing, discards
/// every change made through it.
#[async_trait]
pub trait UnitOfWork: Send {
	/// Reads a live row.
	async fn get(&mut self, table: StorageTable, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

	/// Reads a live row and holds it exclusively until the unit ends.
	async fn lock(&mut self, table: StorageTable, key: &str)
		-> Result<Option<Vec<u8>>, StorageError>;

	/// Inserts a row, failing with [`StorageError::Duplicate`] when a live row
	/// with the same key exists. Rows inserted with a TTL stop being live once
	/// it elapses.
	async fn insert(
		&mut self,
		table: StorageTable,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Replaces the row only if its current image equals `expected`.
	/// Returns the number of rows affected (0 or 1).
	async fn compare_and_swap(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<u64, StorageError>;

	/// Deletes the row only if its current image equals `expected`.
	async fn compare_and_delete(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
	) -> Result<u64, StorageError>;

	/// Deletes the row unconditionally.
	async fn delete(&mut self, table: StorageTable, key: &str) -> Result<u64, StorageError>;

	/// Returns up to `limit` live rows in key order, starting after `start_after`.
	async fn scan(
		&mut self,
		table: StorageTable,
		start_after: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

	/// Returns the next value of the table's sequence. Values increase
	/// monotonically; rolled back units may leave gaps.
	async fn next_sequence(&mut self, table: StorageTable) -> Result<u64, StorageError>;

	async fn commit(&mut self) -> Result<(), StorageError>;

	async fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Trait defining the low-level interface for storage backends.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Opens a new unit of work.
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes rows whose TTL elapsed and returns how many were removed.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Type alias for storage factory functions.
pub type StorageFactory =
	fn(&toml::Value, Arc<dyn Clock>) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// High-level storage service that provides typed operations.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Opens a typed unit of work.
	pub async fn begin(&self) -> Result<Transaction, StorageError> {
		Ok(Transaction {
			unit: self.backend.begin().await?,
		})
	}

	/// Reads one row in its own unit of work, failing with `NotFound` if absent.
	pub async fn retrieve<T>(&self, table: StorageTable, key: &str) -> Result<T, StorageError>
	where
		T: DeserializeOwned + Send,
	{
		self.find(table, key).await?.ok_or(StorageError::NotFound)
	}

	/// Reads one row in its own unit of work.
	pub async fn find<T>(&self, table: StorageTable, key: &str) -> Result<Option<T>, StorageError>
	where
		T: DeserializeOwned + Send,
	{
		let mut tx = self.begin().await?;
		let row = tx.get(table, key).await?;
		tx.commit().await?;
		Ok(row)
	}

	/// Collects up to `limit` rows matching `filter`, in key order.
	pub async fn query<T, F>(
		&self,
		table: StorageTable,
		filter: F,
		limit: usize,
	) -> Result<Vec<T>, StorageError>
	where
		T: DeserializeOwned + Send,
		F: FnMut(&T) -> bool + Send,
	{
		let mut tx = self.begin().await?;
		let rows = tx.query(table, filter, limit).await?;
		tx.commit().await?;
		Ok(rows)
	}

	/// Removes expired entries from storage.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}

/// Typed view of a unit of work.
pub struct Transaction {
	unit: Box<dyn UnitOfWork>,
}

impl Transaction {
	pub async fn get<T>(&mut self, table: StorageTable, key: &str) -> Result<Option<T>, StorageError>
	where
		T: DeserializeOwned + Send,
	{
		match self.unit.get(table, key).await? {
			Some(bytes) => decode(&bytes).map(Some),
			None => Ok(None),
		}
	}

	/// Reads a row and holds it exclusively for the rest of the unit.
	pub async fn get_for_update<T>(
		&mut self,
		table: StorageTable,
		key: &str,
	) -> Result<Option<T>, StorageError>
	where
		T: DeserializeOwned + Send,
	{
		match self.unit.lock(table, key).await? {
			Some(bytes) => decode(&bytes).map(Some),
			None => Ok(None),
		}
	}

	/// Inserts a row, failing with [`StorageError::Duplicate`] if the key is taken.
	pub async fn insert_unique<T>(
		&mut self,
		table: StorageTable,
		key: &str,
		value: &T,
	) -> Result<(), StorageError>
	where
		T: Serialize + Sync,
	{
		self.insert_unique_with_ttl(table, key, value, None).await
	}

	pub async fn insert_unique_with_ttl<T>(
		&mut self,
		table: StorageTable,
		key: &str,
		value: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>
	where
		T: Serialize + Sync,
	{
		let bytes = encode(value)?;
		self.unit.insert(table, key, bytes, ttl).await
	}

	/// Conditional update.
	///
	/// Reads the row, and if `guard` accepts it, applies `apply` and writes the
	/// result back with a compare-and-swap on the image that was read. Returns
	/// the updated row when exactly one row matched, `None` when the row is
	/// missing, the guard rejected it, or another unit changed it first.
	pub async fn update_where<T, G, A>(
		&mut self,
		table: StorageTable,
		key: &str,
		guard: G,
		apply: A,
	) -> Result<Option<T>, StorageError>
	where
		T: Serialize + DeserializeOwned + Send + Sync,
		G: FnOnce(&T) -> bool + Send,
		A: FnOnce(&mut T) + Send,
	{
		let Some(current) = self.unit.get(table, key).await? else {
			return Ok(None);
		};
		let mut row: T = decode(&current)?;
		if !guard(&row) {
			return Ok(None);
		}
		apply(&mut row);
		let next = encode(&row)?;
		match self.unit.compare_and_swap(table, key, &current, next).await? {
			1 => Ok(Some(row)),
			_ => Ok(None),
		}
	}

	pub async fn delete(&mut self, table: StorageTable, key: &str) -> Result<u64, StorageError> {
		self.unit.delete(table, key).await
	}

	/// Deletes the row only if `guard` accepts its current value.
	pub async fn delete_where<T, G>(
		&mut self,
		table: StorageTable,
		key: &str,
		guard: G,
	) -> Result<u64, StorageError>
	where
		T: DeserializeOwned + Send,
		G: FnOnce(&T) -> bool + Send,
	{
		let Some(current) = self.unit.get(table, key).await? else {
			return Ok(0);
		};
		let row: T = decode(&current)?;
		if !guard(&row) {
			return Ok(0);
		}
		self.unit.compare_and_delete(table, key, &current).await
	}

	/// Collects up to `limit` rows matching `filter`, in key order.
	pub async fn query<T, F>(
		&mut self,
		table: StorageTable,
		mut filter: F,
		limit: usize,
	) -> Result<Vec<T>, StorageError>
	where
		T: DeserializeOwned + Send,
		F: FnMut(&T) -> bool + Send,
	{
		let mut out = Vec::new();
		let mut cursor: Option<String> = None;
		while out.len() < limit {
			let page = self.unit.scan(table, cursor.as_deref(), SCAN_PAGE).await?;
			let exhausted = page.len() < SCAN_PAGE;
			for (key, bytes) in page {
				let row: T = decode(&bytes)?;
				cursor = Some(key);
				if filter(&row) {
					out.push(row);
					if out.len() == limit {
						break;
					}
				}
			}
			if exhausted {
				break;
			}
		}
		Ok(out)
	}

	pub async fn next_sequence(&mut self, table: StorageTable) -> Result<u64, StorageError> {
		self.unit.next_sequence(table).await
	}

	/// Makes every change of this unit visible atomically.
	pub async fn commit(mut self) -> Result<(), StorageError> {
		self.unit.commit().await
	}

	/// Discards every change of this unit.
	pub async fn rollback(mut self) -> Result<(), StorageError> {
		self.unit.rollback().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Counter {
		value: u64,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_update_where_respects_guard() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::Stock, "c", &Counter { value: 1 })
			.await
			.unwrap();

		let rejected = tx
			.update_where(StorageTable::Stock, "c", |c: &Counter| c.value == 7, |c| {
				c.value = 100
			})
			.await
			.unwrap();
		assert!(rejected.is_none());

		let applied = tx
			.update_where(StorageTable::Stock, "c", |c: &Counter| c.value == 1, |c| {
				c.value = 2
			})
			.await
			.unwrap();
		assert_eq!(applied, Some(Counter { value: 2 }));
		tx.commit().await.unwrap();

		let stored: Counter = storage.retrieve(StorageTable::Stock, "c").await.unwrap();
		assert_eq!(stored.value, 2);
	}

	#[tokio::test]
	async fn test_update_where_on_missing_row() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		let result = tx
			.update_where(StorageTable::Stock, "nope", |_: &Counter| true, |c| c.value += 1)
			.await
			.unwrap();
		assert!(result.is_none());
	}

	#[tokio::test]
	async fn test_insert_unique_reports_duplicate() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::Inbox, "m1", &Counter { value: 1 })
			.await
			.unwrap();
		let err = tx
			.insert_unique(StorageTable::Inbox, "m1", &Counter { value: 2 })
			.await
			.unwrap_err();
		assert!(err.is_duplicate());
	}

	#[tokio::test]
	async fn test_rollback_discards_changes() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::Orders, "o1", &Counter { value: 1 })
			.await
			.unwrap();
		tx.rollback().await.unwrap();

		let found: Option<Counter> = storage.find(StorageTable::Orders, "o1").await.unwrap();
		assert!(found.is_none());
	}

	#[tokio::test]
	async fn test_dropped_transaction_rolls_back() {
		let storage = service();
		{
			let mut tx = storage.begin().await.unwrap();
			tx.insert_unique(StorageTable::Orders, "o1", &Counter { value: 1 })
				.await
				.unwrap();
		}
		let found: Option<Counter> = storage.find(StorageTable::Orders, "o1").await.unwrap();
		assert!(found.is_none());
	}

	#[tokio::test]
	async fn test_query_pages_through_table() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		for i in 0..(SCAN_PAGE as u64 * 2 + 10) {
			tx.insert_unique(
				StorageTable::Outbox,
				&format!("{:08}", i),
				&Counter { value: i },
			)
			.await
			.unwrap();
		}
		tx.commit().await.unwrap();

		let odd: Vec<Counter> = storage
			.query(StorageTable::Outbox, |c: &Counter| c.value % 2 == 1, 300)
			.await
			.unwrap();
		assert_eq!(odd.len(), 261);
		assert_eq!(odd[0].value, 1);
		assert!(odd.windows(2).all(|w| w[0].value < w[1].value));

		let limited: Vec<Counter> = storage
			.query(StorageTable::Outbox, |_: &Counter| true, 5)
			.await
			.unwrap();
		assert_eq!(limited.len(), 5);
	}

	#[tokio::test]
	async fn test_delete_where() {
		let storage = service();
		let mut tx = storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::Idempotency, "k", &Counter { value: 3 })
			.await
			.unwrap();
		assert_eq!(
			tx.delete_where(StorageTable::Idempotency, "k", |c: &Counter| c.value == 4)
				.await
				.unwrap(),
			0
		);
		assert_eq!(
			tx.delete_where(StorageTable::Idempotency, "k", |c: &Counter| c.value == 3)
				.await
				.unwrap(),
			1
		);
		tx.commit().await.unwrap();
		let found: Option<Counter> = storage.find(StorageTable::Idempotency, "k").await.unwrap();
		assert!(found.is_none());
	}
}
