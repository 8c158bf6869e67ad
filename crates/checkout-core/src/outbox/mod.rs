//! Transactional outbox.
//!
//! Events are appended inside the unit of work that performs the state change
//! they describe, so an event becomes visible exactly when its change commits.
//! The [`OutboxPublisher`] later forwards unpublished events to the bus.
//! Unpublished events are also listed in the `OutboxPending` index, which
//! the publisher reads instead of the ever-growing event table.

pub mod publisher;

pub use publisher::{OutboxPublisher, PublishReport};

use checkout_storage::{StorageError, Transaction};
use checkout_types::{NewOutboxEvent, OutboxEvent, StorageTable};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while appending to or draining the outbox.
#[derive(Debug, Error)]
pub enum OutboxError {
	#[error("Storage error: {0}")]
	Storage(String),
}

impl From<StorageError> for OutboxError {
	fn from(e: StorageError) -> Self {
		OutboxError::Storage(e.to_string())
	}
}

/// Storage key of an outbox row. Zero padding keeps key order equal to
/// sequence order.
pub fn outbox_key(id: u64) -> String {
	format!("{:020}", id)
}

/// Appends an event as part of `tx`.
pub async fn append(
	tx: &mut Transaction,
	event: NewOutboxEvent,
	at: DateTime<Utc>,
) -> Result<OutboxEvent, OutboxError> {
	let id = tx.next_sequence(StorageTable::Outbox).await?;
	let row = OutboxEvent {
		id,
		aggregate_type: event.aggregate_type,
		aggregate_id: event.aggregate_id,
		event_type: event.event_type,
		payload: event.payload,
		created_at: at,
		published: false,
		published_at: None,
	};
	let key = outbox_key(id);
	tx.insert_unique(StorageTable::Outbox, &key, &row).await?;
	tx.insert_unique(StorageTable::OutboxPending, &key, &id).await?;
	tracing::debug!(
		event_id = id,
		event_type = %row.event_type,
		aggregate_id = %row.aggregate_id,
		"Appended outbox event"
	);
	Ok(row)
}
