//! Order types for the checkout system.
//!
//! This module defines the order record, its lifecycle status and the line
//! items an order is created from.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an order.
///
/// Each status carries a stable numeric code. Orders only ever advance along
/// the transition graph owned by the order state machine; `Completed` and
/// `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	/// Created and waiting for payment.
	Pending,
	/// Payment received.
	Paid,
	/// Handed to the carrier.
	Shipped,
	/// Received by the buyer.
	Delivered,
	/// Closed after delivery.
	Completed,
	/// Canceled before payment.
	Canceled,
}

impl OrderStatus {
	/// All statuses in code order.
	pub const ALL: [OrderStatus; 6] = [
		OrderStatus::Pending,
		OrderStatus::Paid,
		OrderStatus::Shipped,
		OrderStatus::Delivered,
		OrderStatus::Completed,
		OrderStatus::Canceled,
	];

	/// Returns the numeric status code.
	pub fn code(&self) -> u8 {
		match self {
			OrderStatus::Pending => 0,
			OrderStatus::Paid => 1,
			OrderStatus::Shipped => 2,
			OrderStatus::Delivered => 3,
			OrderStatus::Completed => 4,
			OrderStatus::Canceled => 5,
		}
	}

	/// Resolves a numeric status code.
	pub fn from_code(code: u8) -> Option<Self> {
		Self::ALL.into_iter().find(|s| s.code() == code)
	}

	/// Returns the string representation of the status.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Pending => "pending",
			OrderStatus::Paid => "paid",
			OrderStatus::Shipped => "shipped",
			OrderStatus::Delivered => "delivered",
			OrderStatus::Completed => "completed",
			OrderStatus::Canceled => "canceled",
		}
	}

	/// Whether no further transition can leave this status.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Completed | OrderStatus::Canceled)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Immutable copy of the delivery address taken when the order is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSnapshot {
	pub name: String,
	pub phone: String,
	pub address: String,
}

/// One purchased sku, drawn from one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
	pub sku: String,
	pub warehouse: String,
	pub quantity: u64,
	pub unit_price: Decimal,
}

impl OrderLine {
	/// Price of the line before freight.
	pub fn subtotal(&self) -> Decimal {
		self.unit_price * Decimal::from(self.quantity)
	}
}

/// Persisted order record.
///
/// A per-transition timestamp is set if and only if its transition has
/// happened. `paid_amount` is written together with the Pending -> Paid
/// transition and never afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	/// Unique identifier for this order.
	pub id: String,
	/// Buyer that placed the order.
	pub buyer_id: String,
	/// Current status of the order.
	pub status: OrderStatus,
	/// Amount the buyer has to pay.
	pub payable_amount: Decimal,
	/// Amount actually paid.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub paid_amount: Option<Decimal>,
	/// External trade reference of the payment that paid this order.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pay_trade_ref: Option<String>,
	/// Carrier tracking number, set when shipped.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tracking_number: Option<String>,
	/// Reason given when the order was canceled.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cancel_reason: Option<String>,
	/// Purchased lines.
	pub lines: Vec<OrderLine>,
	/// Delivery address snapshot.
	pub receiver: ReceiverSnapshot,
	pub created_at: DateTime<Utc>,
	#[serde(default)]
	pub paid_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub shipped_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub delivered_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub canceled_at: Option<DateTime<Utc>>,
}

impl Order {
	/// Returns the timestamp recorded when the order entered `status`.
	///
	/// `Pending` maps to the creation time.
	pub fn entered_at(&self, status: OrderStatus) -> Option<DateTime<Utc>> {
		match status {
			OrderStatus::Pending => Some(self.created_at),
			OrderStatus::Paid => self.paid_at,
			OrderStatus::Shipped => self.shipped_at,
			OrderStatus::Delivered => self.delivered_at,
			OrderStatus::Completed => self.completed_at,
			OrderStatus::Canceled => self.canceled_at,
		}
	}

	/// Records `at` as the moment the order entered `status`.
	pub fn mark_entered(&mut self, status: OrderStatus, at: DateTime<Utc>) {
		match status {
			OrderStatus::Pending => self.created_at = at,
			OrderStatus::Paid => self.paid_at = Some(at),
			OrderStatus::Shipped => self.shipped_at = Some(at),
			OrderStatus::Delivered => self.delivered_at = Some(at),
			OrderStatus::Completed => self.completed_at = Some(at),
			OrderStatus::Canceled => self.canceled_at = Some(at),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_codes_are_stable() {
		for status in OrderStatus::ALL {
			assert_eq!(OrderStatus::from_code(status.code()), Some(status));
		}
		assert_eq!(OrderStatus::from_code(6), None);
		assert_eq!(OrderStatus::Canceled.code(), 5);
	}

	#[test]
	fn test_terminal_statuses() {
		let terminal: Vec<_> = OrderStatus::ALL
			.into_iter()
			.filter(|s| s.is_terminal())
			.collect();
		assert_eq!(terminal, vec![OrderStatus::Completed, OrderStatus::Canceled]);
	}

	#[test]
	fn test_line_subtotal() {
		let line = OrderLine {
			sku: "sku-1".into(),
			warehouse: "wh-1".into(),
			quantity: 3,
			unit_price: Decimal::new(1250, 2),
		};
		assert_eq!(line.subtotal(), Decimal::new(3750, 2));
	}
}
