//! Idempotency record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
	/// The command is being executed by the caller that created the record.
	Processing,
	/// The command finished; `response` holds its result.
	Done,
	/// The command was rejected by a business rule; `response` holds the rejection.
	Failed,
}

/// Persisted idempotency record, keyed by the client-supplied key.
///
/// Key uniqueness is the only deduplication mechanism. Once the record leaves
/// `Processing` its response is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
	pub key: String,
	/// Hash of the canonical request.
	pub fingerprint: String,
	pub status: IdempotencyStatus,
	#[serde(default)]
	pub response: Option<serde_json::Value>,
	pub created_at: DateTime<Utc>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}
