//! Storage-related types for the checkout system.

use std::fmt;
use std::str::FromStr;

/// Storage tables for the different record collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageTable {
	/// Orders keyed by order id
	Orders,
	/// Outbox events keyed by zero-padded sequence number
	Outbox,
	/// Index of unpublished outbox events, same keys as `Outbox`
	OutboxPending,
	/// Handled inbound messages keyed by message id
	Inbox,
	/// Idempotency records keyed by client key
	Idempotency,
	/// Payments keyed by payment id
	Payments,
	/// Unique index: external trade reference -> payment id
	PaymentsByExternalRef,
	/// Unique index: internal trade reference -> payment id
	PaymentsByInternalRef,
	/// Stock keyed by length-prefixed sku and warehouse
	Stock,
	/// Reservation markers keyed by order, sku and warehouse
	Reservations,
}

impl StorageTable {
	/// Returns the string representation of the table.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageTable::Orders => "orders",
			StorageTable::Outbox => "outbox",
			StorageTable::OutboxPending => "outbox_pending",
			StorageTable::Inbox => "inbox",
			StorageTable::Idempotency => "idempotency",
			StorageTable::Payments => "payments",
			StorageTable::PaymentsByExternalRef => "payments_by_external_ref",
			StorageTable::PaymentsByInternalRef => "payments_by_internal_ref",
			StorageTable::Stock => "stock",
			StorageTable::Reservations => "reservations",
		}
	}

	/// Returns an iterator over all StorageTable variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Orders,
			Self::Outbox,
			Self::OutboxPending,
			Self::Inbox,
			Self::Idempotency,
			Self::Payments,
			Self::PaymentsByExternalRef,
			Self::PaymentsByInternalRef,
			Self::Stock,
			Self::Reservations,
		]
		.into_iter()
	}
}

impl fmt::Display for StorageTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for StorageTable {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::all().find(|t| t.as_str() == s).ok_or(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_table_names_parse_back() {
		for table in StorageTable::all() {
			assert_eq!(table.as_str().parse::<StorageTable>(), Ok(table));
		}
		assert!("quotes".parse::<StorageTable>().is_err());
	}
}
