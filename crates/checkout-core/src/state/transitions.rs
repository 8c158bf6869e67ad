//! Static transition table of the order lifecycle.
//!
//! Routing an operation is a lookup of `(current status, operation)`; the
//! table is plain data so every edge can be enumerated and tested.

use checkout_types::{OrderEventType, OrderStatus};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Operations that move an order along the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Pay,
	Ship,
	Deliver,
	Complete,
	Cancel,
}

impl Operation {
	pub const ALL: [Operation; 5] = [
		Operation::Pay,
		Operation::Ship,
		Operation::Deliver,
		Operation::Complete,
		Operation::Cancel,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Operation::Pay => "pay",
			Operation::Ship => "ship",
			Operation::Deliver => "deliver",
			Operation::Complete => "complete",
			Operation::Cancel => "cancel",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
	pub from: OrderStatus,
	pub operation: Operation,
	pub to: OrderStatus,
	/// Event appended to the outbox when the edge is taken.
	pub event: OrderEventType,
}

/// Every permitted edge. Pairs not listed here are not applicable.
pub static TRANSITIONS: [Transition; 5] = [
	Transition {
		from: OrderStatus::Pending,
		operation: Operation::Pay,
		to: OrderStatus::Paid,
		event: OrderEventType::OrderPaid,
	},
	Transition {
		from: OrderStatus::Pending,
		operation: Operation::Cancel,
		to: OrderStatus::Canceled,
		event: OrderEventType::OrderCanceled,
	},
	Transition {
		from: OrderStatus::Paid,
		operation: Operation::Ship,
		to: OrderStatus::Shipped,
		event: OrderEventType::OrderShipped,
	},
	Transition {
		from: OrderStatus::Shipped,
		operation: Operation::Deliver,
		to: OrderStatus::Delivered,
		event: OrderEventType::OrderDelivered,
	},
	Transition {
		from: OrderStatus::Delivered,
		operation: Operation::Complete,
		to: OrderStatus::Completed,
		event: OrderEventType::OrderCompleted,
	},
];

static INDEX: Lazy<HashMap<(OrderStatus, Operation), &'static Transition>> = Lazy::new(|| {
	TRANSITIONS
		.iter()
		.map(|t| ((t.from, t.operation), t))
		.collect()
});

/// Returns the edge taken by `operation` from `from`, if any.
pub fn lookup(from: OrderStatus, operation: Operation) -> Option<&'static Transition> {
	INDEX.get(&(from, operation)).copied()
}

/// Operations permitted from `from`.
pub fn allowed_operations(from: OrderStatus) -> impl Iterator<Item = Operation> {
	TRANSITIONS
		.iter()
		.filter(move |t| t.from == from)
		.map(|t| t.operation)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_full_table() {
		let expected = [
			(OrderStatus::Pending, Operation::Pay, Some(OrderStatus::Paid)),
			(OrderStatus::Pending, Operation::Cancel, Some(OrderStatus::Canceled)),
			(OrderStatus::Paid, Operation::Ship, Some(OrderStatus::Shipped)),
			(OrderStatus::Shipped, Operation::Deliver, Some(OrderStatus::Delivered)),
			(OrderStatus::Delivered, Operation::Complete, Some(OrderStatus::Completed)),
		];

		let mut permitted = 0;
		for from in OrderStatus::ALL {
			for operation in Operation::ALL {
				let target = lookup(from, operation).map(|t| t.to);
				let wanted = expected
					.iter()
					.find(|(f, o, _)| *f == from && *o == operation)
					.and_then(|(_, _, to)| *to);
				assert_eq!(target, wanted, "{} --{}-->", from, operation);
				permitted += usize::from(target.is_some());
			}
		}
		assert_eq!(permitted, TRANSITIONS.len());
	}

	#[test]
	fn test_terminal_states_have_no_edges() {
		for status in OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
			assert_eq!(allowed_operations(status).count(), 0);
		}
	}

	#[test]
	fn test_each_edge_emits_its_own_event() {
		let mut events: Vec<_> = TRANSITIONS.iter().map(|t| t.event).collect();
		events.dedup();
		assert_eq!(events.len(), TRANSITIONS.len());
		assert_eq!(
			lookup(OrderStatus::Pending, Operation::Pay).map(|t| t.event),
			Some(OrderEventType::OrderPaid)
		);
	}

	#[test]
	fn test_pending_allows_pay_and_cancel() {
		let ops: Vec<_> = allowed_operations(OrderStatus::Pending).collect();
		assert_eq!(ops, vec![Operation::Pay, Operation::Cancel]);
	}
}
