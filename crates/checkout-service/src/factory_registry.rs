//! Factory registry for checkout implementations.
//!
//! Collects the factory functions of every storage and bus implementation
//! so the engine can be built from whatever the configuration names.

use checkout_bus::BusFactory;
use checkout_config::Config;
use checkout_core::{CheckoutBuilder, CheckoutEngine, CheckoutFactories};
use checkout_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Registry of all implementation factories, keyed by implementation name.
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub bus: HashMap<String, BusFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			bus: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_bus(&mut self, name: impl Into<String>, factory: BusFactory) {
		self.bus.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Initializes the registry with every available implementation.
pub fn initialize_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in checkout_storage::get_all_implementations() {
			tracing::debug!(implementation = name, "Registering storage implementation");
			registry.register_storage(name, factory);
		}

		for (name, factory) in checkout_bus::get_all_implementations() {
			tracing::debug!(implementation = name, "Registering bus implementation");
			registry.register_bus(name, factory);
		}

		registry
	})
}

/// Builds the engine with the registered factories.
pub fn build_engine(config: Config) -> Result<CheckoutEngine, Box<dyn std::error::Error>> {
	let registry = initialize_registry();
	let factories = CheckoutFactories {
		storage_factories: registry.storage.clone(),
		bus_factories: registry.bus.clone(),
	};
	Ok(CheckoutBuilder::new(config).build(factories)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use checkout_config::ConfigBuilder;

	#[test]
	fn test_registry_contains_all_implementations() {
		let registry = initialize_registry();
		for name in ["file", "memory"] {
			assert!(registry.storage.contains_key(name), "missing storage {}", name);
		}
		for name in ["log", "memory"] {
			assert!(registry.bus.contains_key(name), "missing bus {}", name);
		}
	}

	#[tokio::test]
	async fn test_build_engine_with_memory_config() {
		let config = ConfigBuilder::new().service_id("svc-test").build();
		let engine = build_engine(config).unwrap();
		assert_eq!(engine.config().service.id, "svc-test");
		assert!(engine.stock("sku", "wh").await.unwrap().is_none());
	}
}
