//! In-memory storage backend implementation.
//!
//! This module provides a memory-based implementation of the StorageInterface
//! trait, useful for testing and development scenarios where persistence is not
//! required. Units of work are serialized against each other.

use crate::engine::{Engine, Tables};
use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry, UnitOfWork};
use async_trait::async_trait;
use checkout_types::{
	Clock, ConfigSchema, ImplementationRegistry, Schema, SystemClock, ValidationError,
};
use std::sync::Arc;

/// In-memory storage implementation.
pub struct MemoryStorage {
	engine: Engine,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance driven by the system clock.
	pub fn new() -> Self {
		Self::with_clock(Arc::new(SystemClock))
	}

	/// Creates a new MemoryStorage instance that evaluates TTLs against `clock`.
	pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
		Self {
			engine: Engine::new(Tables::default(), clock, None),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
		Ok(Box::new(self.engine.begin().await))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.engine.cleanup_expired().await
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no required configuration
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(
	config: &toml::Value,
	clock: Arc<dyn Clock>,
) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStorage::with_clock(clock)))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use checkout_types::StorageTable;
	use futures::future::join_all;

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let mut unit = storage.begin().await.unwrap();
		unit.insert(StorageTable::Orders, "o1", b"value".to_vec(), None)
			.await
			.unwrap();
		unit.commit().await.unwrap();

		let mut unit = storage.begin().await.unwrap();
		assert_eq!(
			unit.get(StorageTable::Orders, "o1").await.unwrap(),
			Some(b"value".to_vec())
		);
		assert_eq!(unit.delete(StorageTable::Orders, "o1").await.unwrap(), 1);
		assert_eq!(unit.delete(StorageTable::Orders, "o1").await.unwrap(), 0);
		unit.commit().await.unwrap();

		let mut unit = storage.begin().await.unwrap();
		assert_eq!(unit.get(StorageTable::Orders, "o1").await.unwrap(), None);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_compare_and_swap_has_one_winner() {
		let storage = Arc::new(MemoryStorage::new());
		let mut unit = storage.begin().await.unwrap();
		unit.insert(StorageTable::Orders, "o1", b"pending".to_vec(), None)
			.await
			.unwrap();
		unit.commit().await.unwrap();

		let attempts = (0..16).map(|i| {
			let storage = storage.clone();
			tokio::spawn(async move {
				let mut unit = storage.begin().await.unwrap();
				let affected = unit
					.compare_and_swap(
						StorageTable::Orders,
						"o1",
						b"pending",
						format!("paid-{}", i).into_bytes(),
					)
					.await
					.unwrap();
				unit.commit().await.unwrap();
				affected
			})
		});

		let affected: u64 = join_all(attempts)
			.await
			.into_iter()
			.map(|r| r.unwrap())
			.sum();
		assert_eq!(affected, 1);
	}

	#[test]
	fn test_factory_rejects_non_table_config() {
		let result = create_storage(&toml::Value::Integer(1), Arc::new(SystemClock));
		assert!(matches!(result, Err(StorageError::Configuration(_))));
	}
}
