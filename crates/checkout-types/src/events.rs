//! Event types for outbound notification.
//!
//! Events are appended to the outbox inside the same unit of work as the state
//! change they describe, then forwarded to the message bus by the outbox
//! publisher. Consumers receive each event at least once and deduplicate by
//! `event_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate type recorded on order events.
pub const ORDER_AGGREGATE: &str = "order";

/// Event types emitted for realized order transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventType {
	/// An order was created and its stock reserved.
	OrderCreated,
	/// Pending -> Paid.
	OrderPaid,
	/// Paid -> Shipped.
	OrderShipped,
	/// Shipped -> Delivered.
	OrderDelivered,
	/// Delivered -> Completed.
	OrderCompleted,
	/// Pending -> Canceled.
	OrderCanceled,
}

impl OrderEventType {
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderEventType::OrderCreated => "OrderCreated",
			OrderEventType::OrderPaid => "OrderPaid",
			OrderEventType::OrderShipped => "OrderShipped",
			OrderEventType::OrderDelivered => "OrderDelivered",
			OrderEventType::OrderCompleted => "OrderCompleted",
			OrderEventType::OrderCanceled => "OrderCanceled",
		}
	}
}

impl fmt::Display for OrderEventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An event about to be appended to the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
	pub aggregate_type: String,
	pub aggregate_id: String,
	pub event_type: String,
	pub payload: serde_json::Value,
}

/// Persisted outbox row.
///
/// Rows are append-only. `published` moves from `false` to `true` exactly once
/// and is never reset; rows are kept after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
	/// Storage-assigned sequence number, increasing in creation order.
	pub id: u64,
	pub aggregate_type: String,
	pub aggregate_id: String,
	pub event_type: String,
	pub payload: serde_json::Value,
	pub created_at: DateTime<Utc>,
	pub published: bool,
	#[serde(default)]
	pub published_at: Option<DateTime<Utc>>,
}

/// Record forwarded to the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
	/// Identity consumers deduplicate on.
	pub event_id: u64,
	pub aggregate_type: String,
	pub aggregate_id: String,
	pub event_type: String,
	pub payload: serde_json::Value,
	pub created_at: DateTime<Utc>,
}

impl From<&OutboxEvent> for PublishedEvent {
	fn from(event: &OutboxEvent) -> Self {
		Self {
			event_id: event.id,
			aggregate_type: event.aggregate_type.clone(),
			aggregate_id: event.aggregate_id.clone(),
			event_type: event.event_type.clone(),
			payload: event.payload.clone(),
			created_at: event.created_at,
		}
	}
}
