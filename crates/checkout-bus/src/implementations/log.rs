//! Bus implementation that writes each event to the log.
//!
//! Useful when no broker is deployed: every published event becomes one
//! structured `tracing` line under the `checkout::events` target.

use crate::{BusError, BusFactory, BusInterface, BusRegistry};
use async_trait::async_trait;
use checkout_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, PublishedEvent, Schema,
	ValidationError,
};

/// Bus that logs events instead of forwarding them.
pub struct LogBus {
	include_payload: bool,
}

impl LogBus {
	pub fn new(include_payload: bool) -> Self {
		Self { include_payload }
	}
}

#[async_trait]
impl BusInterface for LogBus {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LogBusSchema)
	}

	async fn publish(&self, event: &PublishedEvent) -> Result<(), BusError> {
		if self.include_payload {
			let payload = serde_json::to_string(&event.payload)
				.map_err(|e| BusError::Serialization(e.to_string()))?;
			tracing::info!(
				target: "checkout::events",
				event_id = event.event_id,
				aggregate_type = %event.aggregate_type,
				aggregate_id = %event.aggregate_id,
				event_type = %event.event_type,
				created_at = %event.created_at,
				payload = %payload,
				"Event published"
			);
		} else {
			tracing::info!(
				target: "checkout::events",
				event_id = event.event_id,
				aggregate_type = %event.aggregate_type,
				aggregate_id = %event.aggregate_id,
				event_type = %event.event_type,
				created_at = %event.created_at,
				"Event published"
			);
		}
		Ok(())
	}
}

/// Configuration schema for LogBus.
pub struct LogBusSchema;

impl ConfigSchema for LogBusSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![Field::new("include_payload", FieldType::Boolean)])
			.validate(config)
	}
}

/// Factory function to create a log bus from configuration.
///
/// Configuration parameters:
/// - `include_payload`: Whether to log event payloads (default: false)
pub fn create_bus(config: &toml::Value) -> Result<Box<dyn BusInterface>, BusError> {
	LogBusSchema
		.validate(config)
		.map_err(|e| BusError::Configuration(e.to_string()))?;

	let include_payload = config
		.get("include_payload")
		.and_then(|v| v.as_bool())
		.unwrap_or(false);

	Ok(Box::new(LogBus::new(include_payload)))
}

/// Registry for the log bus implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "log";
	type Factory = BusFactory;

	fn factory() -> Self::Factory {
		create_bus
	}
}

impl BusRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_schema_rejects_non_boolean_flag() {
		let config: toml::Value = toml::from_str("include_payload = \"yes\"").unwrap();
		assert!(matches!(create_bus(&config), Err(BusError::Configuration(_))));
	}

	#[tokio::test]
	async fn test_publish_always_succeeds() {
		let bus = LogBus::new(true);
		let event = PublishedEvent {
			event_id: 1,
			aggregate_type: "order".into(),
			aggregate_id: "o1".into(),
			event_type: "OrderPaid".into(),
			payload: serde_json::json!({"amount": "100.00"}),
			created_at: chrono::Utc::now(),
		};
		assert!(bus.publish(&event).await.is_ok());
	}
}
