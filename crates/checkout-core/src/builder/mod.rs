//! Builder pattern for constructing checkout engines.
//!
//! Composes a CheckoutEngine from the storage and bus implementations named
//! in the configuration, using factory functions registered by name.

use crate::engine::CheckoutEngine;
use checkout_bus::{BusError, BusInterface, BusService};
use checkout_config::Config;
use checkout_storage::{StorageError, StorageInterface, StorageService};
use checkout_types::{Clock, SystemClock};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during checkout engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions needed to build a CheckoutEngine, keyed by
/// implementation name.
pub struct CheckoutFactories<SF, BF> {
	pub storage_factories: HashMap<String, SF>,
	pub bus_factories: HashMap<String, BF>,
}

/// Builder for constructing a CheckoutEngine with pluggable implementations.
pub struct CheckoutBuilder {
	config: Config,
	clock: Arc<dyn Clock>,
}

impl CheckoutBuilder {
	/// Creates a new CheckoutBuilder driven by the system clock.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			clock: Arc::new(SystemClock),
		}
	}

	/// Replaces the clock handed to every component.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Builds the CheckoutEngine using the factories for each component type.
	pub fn build<SF, BF>(
		self,
		factories: CheckoutFactories<SF, BF>,
	) -> Result<CheckoutEngine, BuilderError>
	where
		SF: Fn(&toml::Value, Arc<dyn Clock>) -> Result<Box<dyn StorageInterface>, StorageError>,
		BF: Fn(&toml::Value) -> Result<Box<dyn BusInterface>, BusError>,
	{
		let clock = self.clock.clone();
		let storage_backend: Box<dyn StorageInterface> = load_primary(
			"storage",
			&self.config.storage.primary,
			&self.config.storage.implementations,
			&factories.storage_factories,
			|factory, config| factory(config, clock.clone()),
		)?;
		let bus_backend: Box<dyn BusInterface> = load_primary(
			"bus",
			&self.config.bus.primary,
			&self.config.bus.implementations,
			&factories.bus_factories,
			|factory, config| factory(config),
		)?;

		let storage = Arc::new(StorageService::new(storage_backend));
		let bus = Arc::new(BusService::new(bus_backend));
		Ok(CheckoutEngine::new(self.config, storage, bus, self.clock))
	}
}

/// Instantiates every configured implementation that has a factory and
/// returns the primary one.
fn load_primary<F, T, E, C>(
	component: &'static str,
	primary: &str,
	configs: &HashMap<String, toml::Value>,
	factories: &HashMap<String, F>,
	create: C,
) -> Result<T, BuilderError>
where
	E: Display,
	C: Fn(&F, &toml::Value) -> Result<T, E>,
{
	let mut loaded = HashMap::new();
	for (name, config) in configs {
		let Some(factory) = factories.get(name) else {
			tracing::warn!(component, implementation = %name, "No factory registered, skipping");
			continue;
		};
		match create(factory, config) {
			Ok(implementation) => {
				let is_primary = primary == name;
				tracing::info!(component, implementation = %name, enabled = %is_primary, "Loaded");
				loaded.insert(name.clone(), implementation);
			},
			Err(e) => {
				tracing::error!(
					component,
					implementation = %name,
					error = %e,
					"Failed to create implementation"
				);
				return Err(BuilderError::Config(format!(
					"Failed to create {} implementation '{}': {}",
					component, name, e
				)));
			},
		}
	}

	if loaded.is_empty() {
		return Err(BuilderError::MissingComponent(format!(
			"no valid {} implementations available",
			component
		)));
	}

	loaded.remove(primary).ok_or_else(|| {
		BuilderError::Config(format!(
			"Primary {} '{}' failed to load or has invalid configuration",
			component, primary
		))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use checkout_config::ConfigBuilder;
	use checkout_types::ManualClock;

	fn factories() -> CheckoutFactories<checkout_storage::StorageFactory, checkout_bus::BusFactory> {
		CheckoutFactories {
			storage_factories: checkout_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			bus_factories: checkout_bus::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		}
	}

	fn table(entries: &[(&str, toml::Value)]) -> toml::Value {
		toml::Value::Table(
			entries
				.iter()
				.map(|(k, v)| (k.to_string(), v.clone()))
				.collect(),
		)
	}

	#[tokio::test]
	async fn test_builds_engine_from_memory_config() {
		let clock = Arc::new(ManualClock::default());
		let engine = CheckoutBuilder::new(ConfigBuilder::new().build())
			.with_clock(clock.clone())
			.build(factories())
			.unwrap();

		let stock = engine.receive_stock("sku", "wh", 3).await.unwrap();
		assert_eq!(stock.qty_on_hand, 3);
		assert_eq!(engine.clock().now(), clock.now());
	}

	#[tokio::test]
	async fn test_file_storage_survives_rebuild() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data").display().to_string();
		let config = || {
			ConfigBuilder::new()
				.storage("file", table(&[("storage_path", toml::Value::String(path.clone()))]))
				.build()
		};

		{
			let engine = CheckoutBuilder::new(config()).build(factories()).unwrap();
			engine.receive_stock("sku", "wh", 2).await.unwrap();
		}

		let engine = CheckoutBuilder::new(config()).build(factories()).unwrap();
		let stock = engine.stock("sku", "wh").await.unwrap().unwrap();
		assert_eq!(stock.qty_on_hand, 2);
	}

	#[test]
	fn test_unknown_primary_is_rejected() {
		let config = ConfigBuilder::new()
			.storage("redis", table(&[]))
			.build();
		let result = CheckoutBuilder::new(config).build(factories());
		assert!(matches!(result, Err(BuilderError::MissingComponent(_))));
	}

	#[test]
	fn test_invalid_implementation_config_is_rejected() {
		let config = ConfigBuilder::new()
			.bus("log", table(&[("include_payload", toml::Value::String("yes".into()))]))
			.build();
		let result = CheckoutBuilder::new(config).build(factories());
		assert!(matches!(result, Err(BuilderError::Config(_))));
	}
}
