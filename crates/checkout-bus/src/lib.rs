//! Message bus module for the checkout system.
//!
//! Outbox events leave the process through this port. Delivery is
//! at-least-once: an event may be handed to the bus again after a crash
//! between publication and the outbox row being marked, so consumers
//! deduplicate by `event_id`.

use async_trait::async_trait;
use checkout_types::{ConfigSchema, ImplementationRegistry, PublishedEvent};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod log;
	pub mod memory;
}

/// Errors that can occur while publishing events.
#[derive(Debug, Error)]
pub enum BusError {
	/// The bus could not be reached or refused the event.
	#[error("Publish failed: {0}")]
	Publish(String),
	/// The event could not be encoded for the bus.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Trait defining the interface for message bus implementations.
#[async_trait]
pub trait BusInterface: Send + Sync {
	/// Returns the configuration schema for this bus implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Hands one event to the bus. Returning `Ok` means the bus accepted it.
	async fn publish(&self, event: &PublishedEvent) -> Result<(), BusError>;
}

/// Type alias for bus factory functions.
pub type BusFactory = fn(&toml::Value) -> Result<Box<dyn BusInterface>, BusError>;

/// Registry trait for bus implementations.
pub trait BusRegistry: ImplementationRegistry<Factory = BusFactory> {}

/// Get all registered bus implementations.
pub fn get_all_implementations() -> Vec<(&'static str, BusFactory)> {
	use implementations::{log, memory};

	vec![
		(log::Registry::NAME, log::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Service wrapping the configured bus implementation.
pub struct BusService {
	implementation: Box<dyn BusInterface>,
}

impl BusService {
	pub fn new(implementation: Box<dyn BusInterface>) -> Self {
		Self { implementation }
	}

	/// Publishes one event.
	pub async fn publish(&self, event: &PublishedEvent) -> Result<(), BusError> {
		self.implementation.publish(event).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_registered_implementations() {
		let names: Vec<_> = get_all_implementations()
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		assert_eq!(names, vec!["log", "memory"]);
	}

	#[test]
	fn test_factories_accept_empty_tables() {
		let empty = toml::Value::Table(toml::map::Map::new());
		for (name, factory) in get_all_implementations() {
			assert!(factory(&empty).is_ok(), "{} rejected an empty table", name);
		}
	}
}
