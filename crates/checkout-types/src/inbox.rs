//! Inbox entry type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Proof that an inbound message was handled.
///
/// The row's existence is the only signal; it is keyed by the provider-issued
/// message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
	pub message_id: String,
	pub source: String,
	pub processed_at: DateTime<Utc>,
}
