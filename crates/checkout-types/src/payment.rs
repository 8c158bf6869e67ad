//! Payment types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Status of a recorded payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
	Succeeded,
	Refunded,
}

/// Persisted payment record.
///
/// Both trade references are unique; the external one is a second layer of
/// create-idempotency for payment attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
	pub id: String,
	pub order_id: String,
	pub channel: String,
	/// Reference issued by the payment provider.
	pub external_trade_ref: String,
	/// Reference issued by this system.
	pub internal_trade_ref: String,
	pub status: PaymentStatus,
	pub amount: Decimal,
	pub created_at: DateTime<Utc>,
}

/// Inbound payment notification, delivered at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
	/// Provider-issued unique message id.
	pub message_id: String,
	/// Provider name.
	pub source: String,
	pub order_id: String,
	pub amount: Decimal,
	pub channel: String,
	pub external_trade_ref: String,
}
