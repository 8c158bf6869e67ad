//! Inbox deduplication for inbound notifications.
//!
//! The presence of an inbox row is the only proof that a message was handled.
//! Recording the message id is a unique insert performed before any side
//! effect, in the same unit of work as those effects.

use checkout_storage::{StorageError, StorageService, Transaction};
use checkout_types::{truncate_id, Clock, InboxEntry, StorageTable};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboxError {
	#[error("Storage error: {0}")]
	Storage(String),
}

impl From<StorageError> for InboxError {
	fn from(e: StorageError) -> Self {
		InboxError::Storage(e.to_string())
	}
}

pub struct Inbox {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl Inbox {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	/// Records `message_id` as part of `tx`.
	///
	/// Returns `false` when the message was already handled; `tx` is then
	/// unchanged and the caller must skip every side effect.
	pub async fn record(
		&self,
		tx: &mut Transaction,
		message_id: &str,
		source: &str,
	) -> Result<bool, InboxError> {
		let entry = InboxEntry {
			message_id: message_id.to_string(),
			source: source.to_string(),
			processed_at: self.clock.now(),
		};
		match tx.insert_unique(StorageTable::Inbox, message_id, &entry).await {
			Ok(()) => Ok(true),
			Err(e) if e.is_duplicate() => {
				tracing::debug!(
					message_id = %truncate_id(message_id),
					source = %source,
					"Message already handled"
				);
				Ok(false)
			},
			Err(e) => Err(e.into()),
		}
	}

	/// Records `message_id` in its own unit of work.
	pub async fn insert_once(&self, message_id: &str, source: &str) -> Result<bool, InboxError> {
		let mut tx = self.storage.begin().await?;
		let inserted = self.record(&mut tx, message_id, source).await?;
		tx.commit().await?;
		Ok(inserted)
	}

	pub async fn get(&self, message_id: &str) -> Result<Option<InboxEntry>, InboxError> {
		Ok(self.storage.find(StorageTable::Inbox, message_id).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::Harness;

	#[tokio::test]
	async fn test_insert_once_per_message_id() {
		let h = Harness::new();
		let inbox = h.inbox();

		assert!(inbox.insert_once("m1", "psp").await.unwrap());
		let first = inbox.get("m1").await.unwrap().unwrap();

		h.clock.advance(chrono::Duration::seconds(30));
		assert!(!inbox.insert_once("m1", "psp").await.unwrap());
		assert!(!inbox.insert_once("m1", "other").await.unwrap());
		assert_eq!(inbox.get("m1").await.unwrap(), Some(first));

		assert!(inbox.insert_once("m2", "psp").await.unwrap());
	}

	#[tokio::test]
	async fn test_rolled_back_record_is_forgotten() {
		let h = Harness::new();
		let inbox = h.inbox();

		let mut tx = h.storage.begin().await.unwrap();
		assert!(inbox.record(&mut tx, "m1", "psp").await.unwrap());
		tx.rollback().await.unwrap();

		assert!(inbox.get("m1").await.unwrap().is_none());
		assert!(inbox.insert_once("m1", "psp").await.unwrap());
	}
}
