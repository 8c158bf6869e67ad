//! Configuration builder for creating test and development configurations.
//!
//! The built configuration selects the in-memory storage and bus
//! implementations unless told otherwise, so it can be handed straight to the
//! engine builder.

use crate::{
	BusConfig, Config, IdempotencyConfig, InventoryConfig, OutboxConfig, ServiceConfig,
	StorageConfig,
};
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	service_id: String,
	storage_primary: String,
	storage_config: toml::Value,
	storage_cleanup_interval_seconds: u64,
	bus_primary: String,
	bus_config: toml::Value,
	outbox: OutboxConfig,
	idempotency_ttl_seconds: u64,
	reservation_ttl_seconds: u64,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::map::Map::new())
}

impl ConfigBuilder {
	/// Creates a new `ConfigBuilder` with default values suitable for testing.
	pub fn new() -> Self {
		Self {
			service_id: "test-checkout".to_string(),
			storage_primary: "memory".to_string(),
			storage_config: empty_table(),
			storage_cleanup_interval_seconds: 60,
			bus_primary: "memory".to_string(),
			bus_config: empty_table(),
			outbox: OutboxConfig::default(),
			idempotency_ttl_seconds: 3600,
			reservation_ttl_seconds: 900,
		}
	}

	pub fn service_id(mut self, id: impl Into<String>) -> Self {
		self.service_id = id.into();
		self
	}

	/// Sets the primary storage implementation and its configuration table.
	pub fn storage(mut self, primary: impl Into<String>, config: toml::Value) -> Self {
		self.storage_primary = primary.into();
		self.storage_config = config;
		self
	}

	pub fn storage_cleanup_interval_seconds(mut self, interval: u64) -> Self {
		self.storage_cleanup_interval_seconds = interval;
		self
	}

	/// Sets the primary bus implementation and its configuration table.
	pub fn bus(mut self, primary: impl Into<String>, config: toml::Value) -> Self {
		self.bus_primary = primary.into();
		self.bus_config = config;
		self
	}

	pub fn outbox_batch_size(mut self, batch_size: usize) -> Self {
		self.outbox.batch_size = batch_size;
		self
	}

	pub fn outbox_poll_interval_ms(mut self, interval: u64) -> Self {
		self.outbox.poll_interval_ms = interval;
		self
	}

	pub fn idempotency_ttl_seconds(mut self, ttl: u64) -> Self {
		self.idempotency_ttl_seconds = ttl;
		self
	}

	pub fn reservation_ttl_seconds(mut self, ttl: u64) -> Self {
		self.reservation_ttl_seconds = ttl;
		self
	}

	/// Builds the `Config` with the configured values.
	pub fn build(self) -> Config {
		Config {
			service: ServiceConfig {
				id: self.service_id,
			},
			storage: StorageConfig {
				implementations: HashMap::from([(
					self.storage_primary.clone(),
					self.storage_config,
				)]),
				primary: self.storage_primary,
				cleanup_interval_seconds: self.storage_cleanup_interval_seconds,
			},
			bus: BusConfig {
				implementations: HashMap::from([(self.bus_primary.clone(), self.bus_config)]),
				primary: self.bus_primary,
			},
			outbox: self.outbox,
			idempotency: IdempotencyConfig {
				ttl_seconds: self.idempotency_ttl_seconds,
			},
			inventory: InventoryConfig {
				reservation_ttl_seconds: self.reservation_ttl_seconds,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_built_config_is_valid() {
		let config = ConfigBuilder::new().outbox_batch_size(10).build();
		assert!(config.validate().is_ok());
		assert_eq!(config.storage.primary, "memory");
		assert!(config.bus.implementations.contains_key("memory"));
		assert_eq!(config.outbox.batch_size, 10);
	}
}
