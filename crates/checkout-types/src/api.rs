//! Command and response types for the command submission interface.
//!
//! Commands arrive with a caller-supplied idempotency key. The response
//! distinguishes a first execution, a replay of a finished command, and a
//! rejected reuse of the key for a different payload.

use crate::{OrderLine, ReceiverSnapshot};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Request to place an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderCommand {
	pub buyer_id: String,
	pub receiver: ReceiverSnapshot,
	pub lines: Vec<OrderLine>,
	#[serde(default)]
	pub freight: Decimal,
}

impl CreateOrderCommand {
	/// Total amount the buyer will have to pay.
	pub fn payable_amount(&self) -> Decimal {
		self.lines.iter().map(OrderLine::subtotal).sum::<Decimal>() + self.freight
	}

	/// Copy with every amount at its minimal scale, so `1.0` and `1.00`
	/// describe the same request.
	pub fn normalized(&self) -> Self {
		let mut command = self.clone();
		command.freight = command.freight.normalize();
		for line in &mut command.lines {
			line.unit_price = line.unit_price.normalize();
		}
		command
	}
}

/// Result stored for a successfully created order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
	pub order_id: String,
	pub payable_amount: Decimal,
}

/// Business rejection stored against an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
	pub code: String,
	pub message: String,
}

/// Outcome of a command submitted with an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "body", rename_all = "snake_case")]
pub enum CommandResponse<T> {
	/// The command was executed by this request.
	Created(T),
	/// Same key and payload as an earlier finished command; its response is returned.
	Replayed(T),
	/// Same key and payload as a command that has not finished yet.
	InProgress,
	/// The key was already used for a different payload.
	Rejected { reason: String },
	/// The command was rejected by a business rule (possibly on an earlier attempt).
	Failed(CommandFailure),
}

impl<T> CommandResponse<T> {
	/// Returns the payload of a created or replayed command.
	pub fn body(&self) -> Option<&T> {
		match self {
			CommandResponse::Created(body) | CommandResponse::Replayed(body) => Some(body),
			_ => None,
		}
	}
}
