//! Idempotency gateway for client commands.
//!
//! A command is admitted by inserting a `processing` record under the
//! caller's idempotency key. The unique insert is the only deduplication
//! mechanism: a second request with the same key finds the existing record
//! and is answered from it instead of being executed again.

use checkout_storage::{StorageError, StorageService};
use checkout_types::{
	truncate_id, Clock, IdempotencyRecord, IdempotencyStatus, StorageTable,
};
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the idempotency gateway.
#[derive(Debug, Error)]
pub enum IdempotencyError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Idempotency record not found: {0}")]
	NotFound(String),
	/// `finish` or `fail` on a record that already left `processing`.
	#[error("Idempotency record {key} is {status:?}, not processing")]
	NotInProgress {
		key: String,
		status: IdempotencyStatus,
	},
}

impl From<StorageError> for IdempotencyError {
	fn from(e: StorageError) -> Self {
		IdempotencyError::Storage(e.to_string())
	}
}

/// State of an existing record seen by a duplicate request.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
	/// The original request has not finished yet.
	InProgress,
	/// The original request finished; its stored response.
	Done(serde_json::Value),
	/// The original request was rejected; the stored rejection.
	Failed(serde_json::Value),
}

/// Result of admitting a request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
	/// First request with this key. The caller executes it and then calls
	/// `finish` or `fail`.
	New,
	/// Same key and same fingerprint as an earlier request.
	DuplicateSame(RecordState),
	/// Same key, different fingerprint. The request must be rejected.
	DuplicateDifferent,
}

/// Hex-encoded SHA3-256 of the request's canonical JSON encoding.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String, IdempotencyError> {
	let canonical = serde_json::to_vec(request)
		.map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
	Ok(hex::encode(Sha3_256::digest(&canonical)))
}

/// Owner of idempotency records.
pub struct IdempotencyGateway {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
	ttl: Option<Duration>,
}

impl IdempotencyGateway {
	/// Records expire after `ttl`; `None` keeps them forever.
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>, ttl: Option<Duration>) -> Self {
		Self {
			storage,
			clock,
			ttl,
		}
	}

	fn new_record(&self, key: &str, fingerprint: &str) -> IdempotencyRecord {
		let now = self.clock.now();
		IdempotencyRecord {
			key: key.to_string(),
			fingerprint: fingerprint.to_string(),
			status: IdempotencyStatus::Processing,
			response: None,
			created_at: now,
			expires_at: self
				.ttl
				.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
				.and_then(|ttl| now.checked_add_signed(ttl)),
		}
	}

	/// Admits a request under `key`.
	pub async fn start(&self, key: &str, fingerprint: &str) -> Result<StartOutcome, IdempotencyError> {
		let record = self.new_record(key, fingerprint);
		let mut tx = self.storage.begin().await?;

		let existing = match tx
			.insert_unique_with_ttl(StorageTable::Idempotency, key, &record, self.ttl)
			.await
		{
			Ok(()) => None,
			Err(e) if e.is_duplicate() => {
				match tx
					.get::<IdempotencyRecord>(StorageTable::Idempotency, key)
					.await?
				{
					Some(existing) => Some(existing),
					// Expired between the insert and the read.
					None => {
						tx.insert_unique_with_ttl(StorageTable::Idempotency, key, &record, self.ttl)
							.await?;
						None
					},
				}
			},
			Err(e) => return Err(e.into()),
		};
		tx.commit().await?;

		let Some(existing) = existing else {
			tracing::debug!(key = %truncate_id(key), "Admitted new request");
			return Ok(StartOutcome::New);
		};

		if existing.fingerprint != fingerprint {
			tracing::warn!(key = %truncate_id(key), "Idempotency key reused with a different request");
			return Ok(StartOutcome::DuplicateDifferent);
		}

		tracing::debug!(key = %truncate_id(key), status = ?existing.status, "Duplicate request");
		let state = match (existing.status, existing.response) {
			(IdempotencyStatus::Done, Some(response)) => RecordState::Done(response),
			(IdempotencyStatus::Failed, Some(response)) => RecordState::Failed(response),
			_ => RecordState::InProgress,
		};
		Ok(StartOutcome::DuplicateSame(state))
	}

	/// Stores the response of a successfully executed request.
	pub async fn finish(
		&self,
		key: &str,
		response: &serde_json::Value,
	) -> Result<(), IdempotencyError> {
		self.settle(key, IdempotencyStatus::Done, response).await
	}

	/// Stores the rejection of a request that failed a business rule.
	pub async fn fail(
		&self,
		key: &str,
		response: &serde_json::Value,
	) -> Result<(), IdempotencyError> {
		self.settle(key, IdempotencyStatus::Failed, response).await
	}

	async fn settle(
		&self,
		key: &str,
		status: IdempotencyStatus,
		response: &serde_json::Value,
	) -> Result<(), IdempotencyError> {
		let mut tx = self.storage.begin().await?;
		let updated = tx
			.update_where(
				StorageTable::Idempotency,
				key,
				|r: &IdempotencyRecord| r.status == IdempotencyStatus::Processing,
				|r| {
					r.status = status;
					r.response = Some(response.clone());
				},
			)
			.await?;

		if updated.is_some() {
			tx.commit().await?;
			return Ok(());
		}

		let current = tx
			.get::<IdempotencyRecord>(StorageTable::Idempotency, key)
			.await?;
		tx.rollback().await?;
		match current {
			Some(record) => Err(IdempotencyError::NotInProgress {
				key: key.to_string(),
				status: record.status,
			}),
			None => Err(IdempotencyError::NotFound(key.to_string())),
		}
	}

	/// Deletes a record that is still processing so the key can be used again.
	///
	/// Used when execution failed for reasons unrelated to the request itself.
	/// Returns whether a record was removed.
	pub async fn release(&self, key: &str) -> Result<bool, IdempotencyError> {
		let mut tx = self.storage.begin().await?;
		let removed = tx
			.delete_where(
				StorageTable::Idempotency,
				key,
				|r: &IdempotencyRecord| r.status == IdempotencyStatus::Processing,
			)
			.await?;
		tx.commit().await?;
		Ok(removed == 1)
	}

	pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
		Ok(self.storage.find(StorageTable::Idempotency, key).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::Harness;
	use serde_json::json;

	#[tokio::test]
	async fn test_same_fingerprint_is_duplicate_same() {
		let h = Harness::new();
		let gateway = h.idempotency();

		assert_eq!(gateway.start("k", "h").await.unwrap(), StartOutcome::New);
		assert_eq!(
			gateway.start("k", "h").await.unwrap(),
			StartOutcome::DuplicateSame(RecordState::InProgress)
		);
	}

	#[tokio::test]
	async fn test_different_fingerprint_is_duplicate_different() {
		let h = Harness::new();
		let gateway = h.idempotency();

		assert_eq!(gateway.start("k", "h").await.unwrap(), StartOutcome::New);
		assert_eq!(
			gateway.start("k", "h2").await.unwrap(),
			StartOutcome::DuplicateDifferent
		);
	}

	#[tokio::test]
	async fn test_finished_response_is_replayed_and_immutable() {
		let h = Harness::new();
		let gateway = h.idempotency();

		gateway.start("k", "h").await.unwrap();
		gateway.finish("k", &json!({"order_id": "o1"})).await.unwrap();
		assert_eq!(
			gateway.start("k", "h").await.unwrap(),
			StartOutcome::DuplicateSame(RecordState::Done(json!({"order_id": "o1"})))
		);

		let err = gateway.finish("k", &json!({"order_id": "o2"})).await.unwrap_err();
		assert!(matches!(
			err,
			IdempotencyError::NotInProgress {
				status: IdempotencyStatus::Done,
				..
			}
		));
		let record = gateway.get("k").await.unwrap().unwrap();
		assert_eq!(record.response, Some(json!({"order_id": "o1"})));
	}

	#[tokio::test]
	async fn test_failed_request_replays_failure() {
		let h = Harness::new();
		let gateway = h.idempotency();

		gateway.start("k", "h").await.unwrap();
		gateway.fail("k", &json!({"code": "insufficient_stock"})).await.unwrap();
		assert_eq!(
			gateway.start("k", "h").await.unwrap(),
			StartOutcome::DuplicateSame(RecordState::Failed(json!({"code": "insufficient_stock"})))
		);
		assert!(gateway.fail("k", &json!({})).await.is_err());
	}

	#[tokio::test]
	async fn test_finish_unknown_key() {
		let h = Harness::new();
		let err = h.idempotency().finish("missing", &json!(null)).await.unwrap_err();
		assert!(matches!(err, IdempotencyError::NotFound(_)));
	}

	#[tokio::test]
	async fn test_release_frees_processing_key_only() {
		let h = Harness::new();
		let gateway = h.idempotency();

		gateway.start("k", "h").await.unwrap();
		assert!(gateway.release("k").await.unwrap());
		assert_eq!(gateway.start("k", "h2").await.unwrap(), StartOutcome::New);

		gateway.finish("k", &json!(1)).await.unwrap();
		assert!(!gateway.release("k").await.unwrap());
	}

	#[tokio::test]
	async fn test_expired_key_can_be_reused() {
		let h = Harness::new();
		let gateway = IdempotencyGateway::new(
			h.storage.clone(),
			h.clock.clone(),
			Some(Duration::from_secs(60)),
		);

		gateway.start("k", "h").await.unwrap();
		gateway.finish("k", &json!(1)).await.unwrap();
		let record = gateway.get("k").await.unwrap().unwrap();
		assert_eq!(
			record.expires_at,
			Some(record.created_at + chrono::Duration::seconds(60))
		);

		h.clock.advance(chrono::Duration::seconds(61));
		assert_eq!(gateway.start("k", "other").await.unwrap(), StartOutcome::New);
	}

	#[test]
	fn test_fingerprint_is_stable_and_sensitive() {
		let a = fingerprint(&json!({"sku": "a", "qty": 1})).unwrap();
		let b = fingerprint(&json!({"qty": 1, "sku": "a"})).unwrap();
		let c = fingerprint(&json!({"sku": "a", "qty": 2})).unwrap();
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert_eq!(a.len(), 64);
	}
}
