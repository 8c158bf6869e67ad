//! Order handler for client commands.
//!
//! Creates orders behind the idempotency gateway and routes the remaining
//! lifecycle commands to the order state machine.

use crate::idempotency::{self, IdempotencyError, IdempotencyGateway, RecordState, StartOutcome};
use crate::inventory::{InventoryError, InventoryLedger};
use crate::outbox::{self, OutboxError};
use crate::state::{OrderStateError, OrderStateMachine, TransitionOutcome, TransitionRequest};
use checkout_storage::{StorageError, StorageService};
use checkout_types::{
	truncate_id, Clock, CommandFailure, CommandResponse, CreateOrderCommand, NewOutboxEvent, Order,
	OrderEventType, OrderReceipt, OrderStatus, StorageTable, ORDER_AGGREGATE,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Failure code stored when an order cannot be reserved.
pub const INSUFFICIENT_STOCK: &str = "insufficient_stock";

/// Errors that can occur while handling order commands.
///
/// Business rejections of a create command are not errors; they are returned
/// as [`CommandResponse::Failed`] and stored against the idempotency key.
#[derive(Debug, Error)]
pub enum OrderError {
	#[error("Validation error: {0}")]
	Validation(String),
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Idempotency error: {0}")]
	Idempotency(#[from] IdempotencyError),
	#[error("State error: {0}")]
	State(#[from] OrderStateError),
	#[error("Inventory error: {0}")]
	Inventory(#[from] InventoryError),
	#[error("Outbox error: {0}")]
	Outbox(#[from] OutboxError),
}

impl From<StorageError> for OrderError {
	fn from(e: StorageError) -> Self {
		OrderError::Storage(e.to_string())
	}
}

impl From<serde_json::Error> for OrderError {
	fn from(e: serde_json::Error) -> Self {
		OrderError::Serialization(e.to_string())
	}
}

/// Handler for order commands.
pub struct OrderHandler {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
	idempotency: Arc<IdempotencyGateway>,
	state_machine: Arc<OrderStateMachine>,
	inventory: Arc<InventoryLedger>,
}

impl OrderHandler {
	pub fn new(
		storage: Arc<StorageService>,
		clock: Arc<dyn Clock>,
		idempotency: Arc<IdempotencyGateway>,
		state_machine: Arc<OrderStateMachine>,
		inventory: Arc<InventoryLedger>,
	) -> Self {
		Self {
			storage,
			clock,
			idempotency,
			state_machine,
			inventory,
		}
	}

	/// Creates an order at most once per idempotency key.
	#[instrument(skip_all, fields(key = %truncate_id(idempotency_key)))]
	pub async fn create_order(
		&self,
		idempotency_key: &str,
		command: CreateOrderCommand,
	) -> Result<CommandResponse<OrderReceipt>, OrderError> {
		validate_command(&command)?;
		let fingerprint = idempotency::fingerprint(&command.normalized())?;

		match self.idempotency.start(idempotency_key, &fingerprint).await? {
			StartOutcome::New => {},
			StartOutcome::DuplicateSame(RecordState::InProgress) => {
				return Ok(CommandResponse::InProgress);
			},
			StartOutcome::DuplicateSame(RecordState::Done(response)) => {
				return Ok(CommandResponse::Replayed(serde_json::from_value(response)?));
			},
			StartOutcome::DuplicateSame(RecordState::Failed(response)) => {
				return Ok(CommandResponse::Failed(serde_json::from_value(response)?));
			},
			StartOutcome::DuplicateDifferent => {
				return Ok(CommandResponse::Rejected {
					reason: "idempotency key was already used for a different request".into(),
				});
			},
		}

		match self.place(&command).await {
			Ok(receipt) => {
				let finished = match serde_json::to_value(&receipt) {
					Ok(response) => self.idempotency.finish(idempotency_key, &response).await,
					Err(e) => Err(IdempotencyError::Serialization(e.to_string())),
				};
				if let Err(e) = finished {
					// The order is committed, so the key cannot be released for a rerun.
					tracing::warn!(
						order_id = %truncate_id(&receipt.order_id),
						error = %e,
						"Order created but its idempotency key stays in processing until it expires"
					);
					return Err(e.into());
				}
				Ok(CommandResponse::Created(receipt))
			},
			Err(OrderError::Inventory(e @ InventoryError::InsufficientStock { .. })) => {
				let failure = CommandFailure {
					code: INSUFFICIENT_STOCK.to_string(),
					message: e.to_string(),
				};
				tracing::info!(reason = %failure.message, "Order rejected");
				self.idempotency
					.fail(idempotency_key, &serde_json::to_value(&failure)?)
					.await?;
				Ok(CommandResponse::Failed(failure))
			},
			Err(e) => {
				if let Err(release_err) = self.idempotency.release(idempotency_key).await {
					tracing::warn!(error = %release_err, "Failed to release idempotency key");
				}
				Err(e)
			},
		}
	}

	/// Reserves every line, stores the order and its creation event in one unit.
	async fn place(&self, command: &CreateOrderCommand) -> Result<OrderReceipt, OrderError> {
		let order_id = Uuid::new_v4().to_string();
		let mut tx = self.storage.begin().await?;

		for line in &command.lines {
			if let Err(e) = self
				.inventory
				.reserve(&mut tx, &order_id, &line.sku, &line.warehouse, line.quantity)
				.await
			{
				tx.rollback().await?;
				return Err(e.into());
			}
		}

		let now = self.clock.now();
		let order = Order {
			id: order_id.clone(),
			buyer_id: command.buyer_id.clone(),
			status: OrderStatus::Pending,
			payable_amount: command.payable_amount(),
			paid_amount: None,
			pay_trade_ref: None,
			tracking_number: None,
			cancel_reason: None,
			lines: command.lines.clone(),
			receiver: command.receiver.clone(),
			created_at: now,
			paid_at: None,
			shipped_at: None,
			delivered_at: None,
			completed_at: None,
			canceled_at: None,
		};
		tx.insert_unique(StorageTable::Orders, &order.id, &order)
			.await?;
		outbox::append(
			&mut tx,
			NewOutboxEvent {
				aggregate_type: ORDER_AGGREGATE.to_string(),
				aggregate_id: order.id.clone(),
				event_type: OrderEventType::OrderCreated.to_string(),
				payload: json!({
					"order_id": order.id,
					"buyer_id": order.buyer_id,
					"payable_amount": order.payable_amount,
					"lines": order.lines,
				}),
			},
			now,
		)
		.await?;
		tx.commit().await?;

		tracing::info!(
			order_id = %truncate_id(&order.id),
			payable_amount = %order.payable_amount,
			lines = order.lines.len(),
			"Order created"
		);
		Ok(OrderReceipt {
			order_id: order.id,
			payable_amount: order.payable_amount,
		})
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn ship(
		&self,
		order_id: &str,
		tracking_number: &str,
	) -> Result<TransitionOutcome, OrderError> {
		Ok(self.state_machine.ship(order_id, tracking_number).await?)
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn deliver(&self, order_id: &str) -> Result<TransitionOutcome, OrderError> {
		Ok(self.state_machine.deliver(order_id).await?)
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn complete(&self, order_id: &str) -> Result<TransitionOutcome, OrderError> {
		Ok(self.state_machine.complete(order_id).await?)
	}

	/// Cancels a pending order and releases its stock holds in the same unit.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<TransitionOutcome, OrderError> {
		let mut tx = self.storage.begin().await?;
		let request = TransitionRequest::Cancel {
			reason: reason.to_string(),
		};
		let outcome = self.state_machine.apply(&mut tx, order_id, &request).await?;
		if outcome.is_applied() {
			let released = self.inventory.release_all(&mut tx, order_id).await?;
			tracing::debug!(released, "Released reservations of canceled order");
		}
		tx.commit().await?;
		Ok(outcome)
	}

	pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderError> {
		Ok(self.state_machine.get_order(order_id).await?)
	}
}

fn validate_command(command: &CreateOrderCommand) -> Result<(), OrderError> {
	if command.buyer_id.trim().is_empty() {
		return Err(OrderError::Validation("buyer_id must not be empty".into()));
	}
	if command.lines.is_empty() {
		return Err(OrderError::Validation("order must have at least one line".into()));
	}
	if command.freight < Decimal::ZERO {
		return Err(OrderError::Validation("freight must not be negative".into()));
	}

	let mut seen = HashSet::new();
	for line in &command.lines {
		if line.sku.is_empty() || line.warehouse.is_empty() {
			return Err(OrderError::Validation(
				"line sku and warehouse must not be empty".into(),
			));
		}
		if line.quantity == 0 {
			return Err(OrderError::Validation(format!(
				"quantity of {} must be greater than zero",
				line.sku
			)));
		}
		if line.unit_price < Decimal::ZERO {
			return Err(OrderError::Validation(format!(
				"unit price of {} must not be negative",
				line.sku
			)));
		}
		if !seen.insert((line.sku.as_str(), line.warehouse.as_str())) {
			// Reservations are keyed per order, sku and warehouse.
			return Err(OrderError::Validation(format!(
				"duplicate line for {}@{}",
				line.sku, line.warehouse
			)));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{receiver, Harness};
	use checkout_types::{OrderLine, ReservationMarker, Stock};

	fn line(sku: &str, quantity: u64, price: &str) -> OrderLine {
		OrderLine {
			sku: sku.to_string(),
			warehouse: "wh-1".to_string(),
			quantity,
			unit_price: price.parse().unwrap(),
		}
	}

	fn command(lines: Vec<OrderLine>) -> CreateOrderCommand {
		CreateOrderCommand {
			buyer_id: "buyer-1".to_string(),
			receiver: receiver(),
			lines,
			freight: "5.00".parse().unwrap(),
		}
	}

	async fn stock(h: &Harness, sku: &str) -> Stock {
		h.inventory().stock(sku, "wh-1").await.unwrap().unwrap()
	}

	#[tokio::test]
	async fn test_create_order_reserves_and_records_event() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 10).await.unwrap();
		h.inventory().receive("b", "wh-1", 10).await.unwrap();
		let handler = h.order_handler();

		let response = handler
			.create_order("k1", command(vec![line("a", 2, "10.00"), line("b", 1, "2.50")]))
			.await
			.unwrap();
		let CommandResponse::Created(receipt) = response else {
			panic!("expected Created");
		};
		assert_eq!(receipt.payable_amount, "27.50".parse::<Decimal>().unwrap());

		let order = handler.get_order(&receipt.order_id).await.unwrap();
		assert_eq!(order.status, OrderStatus::Pending);
		assert_eq!(order.created_at, h.now());
		assert_eq!(stock(&h, "a").await.reserved, 2);
		assert_eq!(stock(&h, "b").await.reserved, 1);
		assert_eq!(
			h.events_of(&receipt.order_id, OrderEventType::OrderCreated)
				.await
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn test_replay_returns_stored_receipt() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 10).await.unwrap();
		let handler = h.order_handler();
		let cmd = command(vec![line("a", 1, "1.00")]);

		let first = handler.create_order("k1", cmd.clone()).await.unwrap();
		let second = handler.create_order("k1", cmd).await.unwrap();
		assert_eq!(second, CommandResponse::Replayed(first.body().unwrap().clone()));

		assert_eq!(stock(&h, "a").await.reserved, 1);
		assert_eq!(h.outbox_events().await.len(), 1);
	}

	#[tokio::test]
	async fn test_key_reuse_with_other_payload_is_rejected() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 10).await.unwrap();
		let handler = h.order_handler();

		handler
			.create_order("k1", command(vec![line("a", 1, "1.00")]))
			.await
			.unwrap();
		let response = handler
			.create_order("k1", command(vec![line("a", 2, "1.00")]))
			.await
			.unwrap();
		assert!(matches!(response, CommandResponse::Rejected { .. }));
		assert_eq!(stock(&h, "a").await.reserved, 1);
	}

	#[tokio::test]
	async fn test_insufficient_stock_is_stored_failure() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 5).await.unwrap();
		h.inventory().receive("b", "wh-1", 1).await.unwrap();
		let handler = h.order_handler();
		let cmd = command(vec![line("a", 2, "1.00"), line("b", 3, "1.00")]);

		let response = handler.create_order("k1", cmd.clone()).await.unwrap();
		let CommandResponse::Failed(failure) = &response else {
			panic!("expected Failed, got {:?}", response);
		};
		assert_eq!(failure.code, INSUFFICIENT_STOCK);

		// The whole unit rolled back: the hold on the first line is gone too.
		assert_eq!(stock(&h, "a").await.reserved, 0);
		assert_eq!(stock(&h, "b").await.reserved, 0);
		let markers: Vec<ReservationMarker> = h
			.storage
			.query(StorageTable::Reservations, |_: &ReservationMarker| true, 10)
			.await
			.unwrap();
		assert!(markers.is_empty());
		assert!(h.outbox_events().await.is_empty());

		// Retrying with the same key replays the failure without re-executing.
		h.inventory().receive("b", "wh-1", 10).await.unwrap();
		assert_eq!(handler.create_order("k1", cmd).await.unwrap(), response);
		assert_eq!(stock(&h, "b").await.reserved, 0);
	}

	#[tokio::test]
	async fn test_unfinished_request_reports_in_progress() {
		let h = Harness::new();
		let cmd = command(vec![line("a", 1, "1.00")]);
		let fp = idempotency::fingerprint(&cmd.normalized()).unwrap();
		h.idempotency().start("k1", &fp).await.unwrap();

		let response = h.order_handler().create_order("k1", cmd).await.unwrap();
		assert_eq!(response, CommandResponse::InProgress);
	}

	#[tokio::test]
	async fn test_invalid_commands_do_not_consume_the_key() {
		let h = Harness::new();
		let handler = h.order_handler();

		for bad in [
			command(vec![]),
			command(vec![line("a", 0, "1.00")]),
			command(vec![line("a", 1, "-1.00")]),
			command(vec![line("a", 1, "1.00"), line("a", 2, "1.00")]),
		] {
			let result = handler.create_order("k1", bad).await;
			assert!(matches!(result, Err(OrderError::Validation(_))));
		}
		assert!(h.idempotency().get("k1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_cancel_releases_holds_once() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 4).await.unwrap();
		let handler = h.order_handler();

		let response = handler
			.create_order("k1", command(vec![line("a", 3, "1.00")]))
			.await
			.unwrap();
		let order_id = response.body().unwrap().order_id.clone();
		assert_eq!(stock(&h, "a").await.available(), 1);

		let outcome = handler.cancel(&order_id, "changed mind").await.unwrap();
		assert!(outcome.is_applied());
		assert_eq!(stock(&h, "a").await.available(), 4);

		let outcome = handler.cancel(&order_id, "again").await.unwrap();
		assert!(matches!(outcome, TransitionOutcome::NotPermitted { .. }));
		assert_eq!(stock(&h, "a").await.reserved, 0);

		let order = handler.get_order(&order_id).await.unwrap();
		assert_eq!(order.status, OrderStatus::Canceled);
		assert_eq!(order.cancel_reason.as_deref(), Some("changed mind"));
	}

	#[tokio::test]
	async fn test_retry_with_rescaled_amounts_is_replayed() {
		let h = Harness::new();
		h.inventory().receive("a", "wh-1", 10).await.unwrap();
		let handler = h.order_handler();

		let first = handler
			.create_order("k1", command(vec![line("a", 1, "12.50")]))
			.await
			.unwrap();
		let mut rescaled = command(vec![line("a", 1, "12.5")]);
		rescaled.freight = "5".parse().unwrap();
		let second = handler.create_order("k1", rescaled).await.unwrap();

		assert_eq!(second, CommandResponse::Replayed(first.body().unwrap().clone()));
		assert_eq!(stock(&h, "a").await.reserved, 1);
	}

	#[tokio::test]
	async fn test_unrecorded_receipt_keeps_key_in_progress() {
		let h = Harness::failing_updates_of(StorageTable::Idempotency);
		h.inventory().receive("a", "wh-1", 10).await.unwrap();
		let handler = h.order_handler();
		let cmd = command(vec![line("a", 1, "1.00")]);

		let result = handler.create_order("k1", cmd.clone()).await;
		assert!(matches!(result, Err(OrderError::Idempotency(_))));

		// The order itself was committed and is not placed a second time.
		let orders: Vec<Order> = h
			.storage
			.query(StorageTable::Orders, |_: &Order| true, 10)
			.await
			.unwrap();
		assert_eq!(orders.len(), 1);
		let record = h.idempotency().get("k1").await.unwrap().unwrap();
		assert_eq!(record.status, checkout_types::IdempotencyStatus::Processing);
		assert_eq!(
			handler.create_order("k1", cmd).await.unwrap(),
			CommandResponse::InProgress
		);
		assert_eq!(stock(&h, "a").await.reserved, 1);
	}
}
