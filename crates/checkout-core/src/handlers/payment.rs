//! Payment handler for inbound payment notifications.
//!
//! Notifications are delivered at least once. Each one is handled in a single
//! unit of work that records its message id in the inbox, pays the order,
//! stores the payment and consumes the order's stock holds, so a redelivered
//! notification either finds its inbox row or finds nothing committed.

use crate::inbox::{Inbox, InboxError};
use crate::inventory::{InventoryError, InventoryLedger};
use crate::state::{OrderStateError, OrderStateMachine, TransitionOutcome, TransitionRequest};
use checkout_storage::{StorageError, StorageService, Transaction};
use checkout_types::{
	truncate_id, Clock, Order, Payment, PaymentNotification, PaymentStatus, StorageTable,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PaymentError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Inbox error: {0}")]
	Inbox(#[from] InboxError),
	#[error("State error: {0}")]
	State(#[from] OrderStateError),
	#[error("Inventory error: {0}")]
	Inventory(#[from] InventoryError),
}

impl From<StorageError> for PaymentError {
	fn from(e: StorageError) -> Self {
		PaymentError::Storage(e.to_string())
	}
}

/// Result of handling one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
	/// The order was paid by this notification.
	Applied(Order),
	/// The message id was seen before; nothing was done.
	AlreadyHandled,
	/// The message was recorded but the order could not be paid.
	NotApplied { reason: String },
	/// The provider's trade reference was already recorded for another
	/// payment. Nothing was committed.
	DuplicatePayment,
}

/// Handler for payment notifications.
pub struct PaymentHandler {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
	inbox: Arc<Inbox>,
	state_machine: Arc<OrderStateMachine>,
	inventory: Arc<InventoryLedger>,
}

impl PaymentHandler {
	pub fn new(
		storage: Arc<StorageService>,
		clock: Arc<dyn Clock>,
		inbox: Arc<Inbox>,
		state_machine: Arc<OrderStateMachine>,
		inventory: Arc<InventoryLedger>,
	) -> Self {
		Self {
			storage,
			clock,
			inbox,
			state_machine,
			inventory,
		}
	}

	/// Handles a payment notification.
	#[instrument(skip_all, fields(order_id = %truncate_id(&notification.order_id), message_id = %truncate_id(&notification.message_id)))]
	pub async fn handle_notification(
		&self,
		notification: PaymentNotification,
	) -> Result<NotificationOutcome, PaymentError> {
		let mut tx = self.storage.begin().await?;

		if !self
			.inbox
			.record(&mut tx, &notification.message_id, &notification.source)
			.await?
		{
			tx.rollback().await?;
			return Ok(NotificationOutcome::AlreadyHandled);
		}

		let request = TransitionRequest::Pay {
			amount: notification.amount,
			trade_ref: notification.external_trade_ref.clone(),
		};
		let outcome = match self
			.state_machine
			.apply(&mut tx, &notification.order_id, &request)
			.await
		{
			Ok(outcome) => outcome,
			Err(OrderStateError::OrderNotFound(_)) => {
				return self.not_applied(tx, "order not found".into()).await;
			},
			Err(e) => return Err(e.into()),
		};

		let order = match outcome {
			TransitionOutcome::Applied(order) => order,
			TransitionOutcome::NotApplied => {
				return self
					.not_applied(tx, "order is no longer payable with this amount".into())
					.await;
			},
			TransitionOutcome::NotPermitted { from, .. } => {
				return self.not_applied(tx, format!("order is {}", from)).await;
			},
		};

		let payment = Payment {
			id: Uuid::new_v4().to_string(),
			order_id: order.id.clone(),
			channel: notification.channel.clone(),
			external_trade_ref: notification.external_trade_ref.clone(),
			internal_trade_ref: format!("PAY-{}", Uuid::new_v4().simple()),
			status: PaymentStatus::Succeeded,
			amount: notification.amount,
			created_at: self.clock.now(),
		};
		match tx
			.insert_unique(
				StorageTable::PaymentsByExternalRef,
				&payment.external_trade_ref,
				&payment.id,
			)
			.await
		{
			Ok(()) => {},
			Err(e) if e.is_duplicate() => {
				tx.rollback().await?;
				tracing::warn!(
					trade_ref = %notification.external_trade_ref,
					"Trade reference already recorded for another payment"
				);
				return Ok(NotificationOutcome::DuplicatePayment);
			},
			Err(e) => return Err(e.into()),
		}
		tx.insert_unique(
			StorageTable::PaymentsByInternalRef,
			&payment.internal_trade_ref,
			&payment.id,
		)
		.await?;
		tx.insert_unique(StorageTable::Payments, &payment.id, &payment)
			.await?;

		let confirmed = self.inventory.confirm_all(&mut tx, &order.id).await?;
		tx.commit().await?;

		tracing::info!(
			payment_id = %truncate_id(&payment.id),
			amount = %payment.amount,
			confirmed,
			"Payment recorded"
		);
		Ok(NotificationOutcome::Applied(order))
	}

	/// Commits the inbox row alone so the notification is not retried.
	async fn not_applied(
		&self,
		tx: Transaction,
		reason: String,
	) -> Result<NotificationOutcome, PaymentError> {
		tx.commit().await?;
		tracing::info!(reason = %reason, "Payment notification not applied");
		Ok(NotificationOutcome::NotApplied { reason })
	}

	/// Looks up a payment by the provider's trade reference.
	pub async fn payment_by_external_ref(
		&self,
		trade_ref: &str,
	) -> Result<Option<Payment>, PaymentError> {
		let mut tx = self.storage.begin().await?;
		let payment = match tx
			.get::<String>(StorageTable::PaymentsByExternalRef, trade_ref)
			.await?
		{
			Some(id) => tx.get(StorageTable::Payments, &id).await?,
			None => None,
		};
		tx.commit().await?;
		Ok(payment)
	}
}
