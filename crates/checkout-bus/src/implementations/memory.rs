//! In-memory bus implementation.
//!
//! Records every accepted event so tests can assert on what left the outbox.
//! The bus can be switched into a failing mode to exercise redelivery, and can
//! hold each publish for a while to exercise overlapping publishers.

use crate::{BusError, BusFactory, BusInterface, BusRegistry};
use async_trait::async_trait;
use checkout_types::{
	ConfigSchema, ImplementationRegistry, PublishedEvent, Schema, ValidationError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bus that keeps published events in memory.
///
/// Clones share the same recorded events and failure switch.
#[derive(Clone, Default)]
pub struct MemoryBus {
	events: Arc<Mutex<Vec<PublishedEvent>>>,
	failing: Arc<AtomicBool>,
	delay: Arc<Mutex<Duration>>,
}

impl MemoryBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// While set, every publish fails and nothing is recorded.
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	/// Every publish sleeps this long before it is accepted or refused.
	pub fn set_delay(&self, delay: Duration) {
		*self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
	}

	/// Events accepted so far, in publication order.
	pub fn published(&self) -> Vec<PublishedEvent> {
		self.events
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}
}

#[async_trait]
impl BusInterface for MemoryBus {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryBusSchema)
	}

	async fn publish(&self, event: &PublishedEvent) -> Result<(), BusError> {
		let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		if self.failing.load(Ordering::SeqCst) {
			return Err(BusError::Publish("memory bus is failing".into()));
		}
		self.events
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(event.clone());
		Ok(())
	}
}

/// Configuration schema for MemoryBus.
pub struct MemoryBusSchema;

impl ConfigSchema for MemoryBusSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory bus from configuration.
pub fn create_bus(config: &toml::Value) -> Result<Box<dyn BusInterface>, BusError> {
	MemoryBusSchema
		.validate(config)
		.map_err(|e| BusError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryBus::new()))
}

/// Registry for the memory bus implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = BusFactory;

	fn factory() -> Self::Factory {
		create_bus
	}
}

impl BusRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	fn event(id: u64) -> PublishedEvent {
		PublishedEvent {
			event_id: id,
			aggregate_type: "order".into(),
			aggregate_id: "o1".into(),
			event_type: "OrderCreated".into(),
			payload: serde_json::Value::Null,
			created_at: chrono::Utc::now(),
		}
	}

	#[tokio::test]
	async fn test_records_events_until_failing() {
		let bus = MemoryBus::new();
		let observer = bus.clone();

		bus.publish(&event(1)).await.unwrap();
		bus.set_failing(true);
		assert!(bus.publish(&event(2)).await.is_err());
		bus.set_failing(false);
		bus.publish(&event(3)).await.unwrap();

		let ids: Vec<u64> = observer.published().iter().map(|e| e.event_id).collect();
		assert_eq!(ids, vec![1, 3]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_delay_holds_publish() {
		let bus = MemoryBus::new();
		bus.set_delay(Duration::from_millis(50));

		let started = tokio::time::Instant::now();
		bus.publish(&event(1)).await.unwrap();
		assert!(started.elapsed() >= Duration::from_millis(50));
		assert_eq!(bus.published().len(), 1);
	}
}
