//! Order state machine implementation.
//!
//! Moves orders along the lifecycle Pending -> Paid -> Shipped -> Delivered ->
//! Completed, with Pending -> Canceled as the only exit. Each transition is a
//! conditional update on the order row paired with exactly one outbox event in
//! the same unit of work: when the update matches, the event is appended; when
//! it matches nothing, neither happens.

use super::transitions::{self, Operation, Transition};
use crate::outbox::{self, OutboxError};
use checkout_storage::{StorageError, StorageService, Transaction};
use checkout_types::{
	truncate_id, Clock, NewOutboxEvent, Order, OrderStatus, StorageTable, ORDER_AGGREGATE,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during order state management.
#[derive(Debug, Error)]
pub enum OrderStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Order not found: {0}")]
	OrderNotFound(String),
	#[error("Outbox error: {0}")]
	Outbox(#[from] OutboxError),
}

impl From<StorageError> for OrderStateError {
	fn from(e: StorageError) -> Self {
		OrderStateError::Storage(e.to_string())
	}
}

/// A requested transition together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionRequest {
	/// Records a payment. Only matches while the payable amount equals `amount`.
	Pay { amount: Decimal, trade_ref: String },
	Ship { tracking_number: String },
	Deliver,
	Complete,
	Cancel { reason: String },
}

impl TransitionRequest {
	pub fn operation(&self) -> Operation {
		match self {
			TransitionRequest::Pay { .. } => Operation::Pay,
			TransitionRequest::Ship { .. } => Operation::Ship,
			TransitionRequest::Deliver => Operation::Deliver,
			TransitionRequest::Complete => Operation::Complete,
			TransitionRequest::Cancel { .. } => Operation::Cancel,
		}
	}

	/// Transition-specific part of the update predicate.
	fn matches(&self, order: &Order) -> bool {
		match self {
			TransitionRequest::Pay { amount, .. } => order.payable_amount == *amount,
			_ => true,
		}
	}

	fn apply(&self, transition: &Transition, order: &mut Order, at: DateTime<Utc>) {
		match self {
			TransitionRequest::Pay { amount, trade_ref } => {
				order.paid_amount = Some(*amount);
				order.pay_trade_ref = Some(trade_ref.clone());
			},
			TransitionRequest::Ship { tracking_number } => {
				order.tracking_number = Some(tracking_number.clone());
			},
			TransitionRequest::Cancel { reason } => {
				order.cancel_reason = Some(reason.clone());
			},
			TransitionRequest::Deliver | TransitionRequest::Complete => {},
		}
		order.status = transition.to;
		order.mark_entered(transition.to, at);
	}

	fn event_payload(&self, order: &Order, transition: &Transition) -> serde_json::Value {
		let mut payload = json!({
			"order_id": order.id,
			"buyer_id": order.buyer_id,
			"from": transition.from,
			"to": transition.to,
			"at": order.entered_at(transition.to),
		});
		let details = match self {
			TransitionRequest::Pay { amount, trade_ref } => {
				json!({ "paid_amount": amount, "trade_ref": trade_ref })
			},
			TransitionRequest::Ship { tracking_number } => {
				json!({ "tracking_number": tracking_number })
			},
			TransitionRequest::Cancel { reason } => json!({ "reason": reason }),
			TransitionRequest::Deliver | TransitionRequest::Complete => json!({}),
		};
		if let (Some(payload), serde_json::Value::Object(details)) =
			(payload.as_object_mut(), details)
		{
			payload.extend(details);
		}
		payload
	}
}

/// Outcome of a transition attempt. Only `Applied` changed anything.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
	/// The conditional update matched; the updated order is returned.
	Applied(Order),
	/// The conditional update matched no row: another caller got there first,
	/// this is a replay, or the transition-specific predicate did not hold.
	NotApplied,
	/// The order's current status has no edge for the operation.
	NotPermitted {
		from: OrderStatus,
		operation: Operation,
	},
}

impl TransitionOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, TransitionOutcome::Applied(_))
	}
}

/// Sole writer of order status.
pub struct OrderStateMachine {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl OrderStateMachine {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	/// Attempts `request` on the order as part of `tx`.
	///
	/// On `Applied` the order row and its outbox event are both written to
	/// `tx`; on any other outcome `tx` is left untouched.
	pub async fn apply(
		&self,
		tx: &mut Transaction,
		order_id: &str,
		request: &TransitionRequest,
	) -> Result<TransitionOutcome, OrderStateError> {
		let current: Order = tx
			.get(StorageTable::Orders, order_id)
			.await?
			.ok_or_else(|| OrderStateError::OrderNotFound(order_id.to_string()))?;

		let operation = request.operation();
		let Some(transition) = transitions::lookup(current.status, operation) else {
			tracing::debug!(
				order_id = %truncate_id(order_id),
				status = %current.status,
				operation = %operation,
				"Transition not permitted"
			);
			return Ok(TransitionOutcome::NotPermitted {
				from: current.status,
				operation,
			});
		};

		let now = self.clock.now();
		let updated = tx
			.update_where(
				StorageTable::Orders,
				order_id,
				|o: &Order| o.status == transition.from && request.matches(o),
				|o| request.apply(transition, o, now),
			)
			.await?;

		let Some(order) = updated else {
			tracing::debug!(
				order_id = %truncate_id(order_id),
				operation = %operation,
				"Conditional update matched no row"
			);
			return Ok(TransitionOutcome::NotApplied);
		};

		outbox::append(
			tx,
			NewOutboxEvent {
				aggregate_type: ORDER_AGGREGATE.to_string(),
				aggregate_id: order.id.clone(),
				event_type: transition.event.to_string(),
				payload: request.event_payload(&order, transition),
			},
			now,
		)
		.await?;

		tracing::info!(
			order_id = %truncate_id(order_id),
			from = %transition.from,
			to = %transition.to,
			"Order transitioned"
		);
		Ok(TransitionOutcome::Applied(order))
	}

	/// Attempts `request` in its own unit of work.
	pub async fn transition(
		&self,
		order_id: &str,
		request: TransitionRequest,
	) -> Result<TransitionOutcome, OrderStateError> {
		let mut tx = self.storage.begin().await?;
		let outcome = self.apply(&mut tx, order_id, &request).await?;
		tx.commit().await?;
		Ok(outcome)
	}

	pub async fn pay(
		&self,
		order_id: &str,
		amount: Decimal,
		trade_ref: impl Into<String>,
	) -> Result<TransitionOutcome, OrderStateError> {
		self.transition(
			order_id,
			TransitionRequest::Pay {
				amount,
				trade_ref: trade_ref.into(),
			},
		)
		.await
	}

	pub async fn ship(
		&self,
		order_id: &str,
		tracking_number: impl Into<String>,
	) -> Result<TransitionOutcome, OrderStateError> {
		self.transition(
			order_id,
			TransitionRequest::Ship {
				tracking_number: tracking_number.into(),
			},
		)
		.await
	}

	pub async fn deliver(&self, order_id: &str) -> Result<TransitionOutcome, OrderStateError> {
		self.transition(order_id, TransitionRequest::Deliver).await
	}

	pub async fn complete(&self, order_id: &str) -> Result<TransitionOutcome, OrderStateError> {
		self.transition(order_id, TransitionRequest::Complete).await
	}

	/// Gets an order by ID
	pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderStateError> {
		self.storage
			.find(StorageTable::Orders, order_id)
			.await?
			.ok_or_else(|| OrderStateError::OrderNotFound(order_id.to_string()))
	}
}
