//! Inventory types: stock rows and reservation markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stock of one sku in one warehouse.
///
/// `reserved <= qty_on_hand` holds at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
	pub sku: String,
	pub warehouse: String,
	pub qty_on_hand: u64,
	pub reserved: u64,
}

impl Stock {
	/// Storage key of the stock row for `sku` in `warehouse`.
	///
	/// The sku is length-prefixed, so no choice of sku and warehouse
	/// characters can make two pairs share a key.
	pub fn key(sku: &str, warehouse: &str) -> String {
		format!("{}:{}@{}", sku.len(), sku, warehouse)
	}

	/// Quantity that can still be reserved.
	pub fn available(&self) -> u64 {
		self.qty_on_hand.saturating_sub(self.reserved)
	}
}

/// An outstanding hold of stock for one order, sku and warehouse.
///
/// The marker is removed either by confirmation (stock is deducted) or by
/// release (the hold is returned to available stock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationMarker {
	pub order_id: String,
	pub sku: String,
	pub warehouse: String,
	pub quantity: u64,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl ReservationMarker {
	/// Storage key of the marker for the (order, sku, warehouse) tuple.
	pub fn key(order_id: &str, sku: &str, warehouse: &str) -> String {
		format!("{}:{}|{}", order_id.len(), order_id, Stock::key(sku, warehouse))
	}

	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_available_never_underflows() {
		let stock = Stock {
			sku: "a".into(),
			warehouse: "w".into(),
			qty_on_hand: 3,
			reserved: 5,
		};
		assert_eq!(stock.available(), 0);
	}

	#[test]
	fn test_marker_key_is_scoped_to_order() {
		assert_ne!(
			ReservationMarker::key("o1", "sku", "wh"),
			ReservationMarker::key("o2", "sku", "wh")
		);
		assert_eq!(ReservationMarker::key("o1", "sku", "wh"), "2:o1|3:sku@wh");
	}

	#[test]
	fn test_separators_in_ids_do_not_collide() {
		assert_ne!(Stock::key("a@b", "c"), Stock::key("a", "b@c"));
		assert_ne!(
			ReservationMarker::key("o|1:x", "y", "w"),
			ReservationMarker::key("o", "1:x|y", "w")
		);
		assert_ne!(
			ReservationMarker::key("o", "a@b", "c"),
			ReservationMarker::key("o", "a", "b@c")
		);
	}
}
