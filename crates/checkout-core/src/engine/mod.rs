//! Checkout engine that wires the components together.
//!
//! Every component receives the same storage handle and clock at
//! construction. The engine exposes the command and notification entry
//! points and owns the background tasks that drain the outbox and purge
//! expired storage rows.

pub mod lifecycle;
pub mod periodic;

use crate::handlers::{
	NotificationOutcome, OrderError, OrderHandler, PaymentError, PaymentHandler,
};
use crate::idempotency::IdempotencyGateway;
use crate::inbox::Inbox;
use crate::inventory::{InventoryError, InventoryLedger};
use crate::outbox::{OutboxError, OutboxPublisher, PublishReport};
use crate::state::{OrderStateMachine, TransitionOutcome};
use checkout_bus::BusService;
use checkout_config::Config;
use checkout_storage::StorageService;
use checkout_types::{
	Clock, CommandResponse, CreateOrderCommand, Order, OrderReceipt, PaymentNotification, Stock,
};
use periodic::PeriodicTask;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Background tasks started by [`CheckoutEngine::start`].
pub(crate) struct BackgroundTasks {
	pub(crate) outbox: PeriodicTask,
	pub(crate) cleanup: PeriodicTask,
}

/// Main checkout engine.
#[derive(Clone)]
pub struct CheckoutEngine {
	pub(crate) config: Config,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) bus: Arc<BusService>,
	pub(crate) clock: Arc<dyn Clock>,
	pub(crate) state_machine: Arc<OrderStateMachine>,
	pub(crate) idempotency: Arc<IdempotencyGateway>,
	pub(crate) inventory: Arc<InventoryLedger>,
	pub(crate) publisher: Arc<OutboxPublisher>,
	pub(crate) order_handler: Arc<OrderHandler>,
	pub(crate) payment_handler: Arc<PaymentHandler>,
	pub(crate) tasks: Arc<BackgroundTasks>,
}

impl CheckoutEngine {
	/// Creates a new engine over the given storage, bus and clock.
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		bus: Arc<BusService>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let state_machine = Arc::new(OrderStateMachine::new(storage.clone(), clock.clone()));
		let idempotency = Arc::new(IdempotencyGateway::new(
			storage.clone(),
			clock.clone(),
			config.idempotency.ttl(),
		));
		let inbox = Arc::new(Inbox::new(storage.clone(), clock.clone()));
		let inventory = Arc::new(InventoryLedger::new(
			storage.clone(),
			clock.clone(),
			config.inventory.reservation_ttl(),
		));
		let publisher = Arc::new(OutboxPublisher::new(
			storage.clone(),
			bus.clone(),
			clock.clone(),
			config.outbox.batch_size,
		));

		let order_handler = Arc::new(OrderHandler::new(
			storage.clone(),
			clock.clone(),
			idempotency.clone(),
			state_machine.clone(),
			inventory.clone(),
		));
		let payment_handler = Arc::new(PaymentHandler::new(
			storage.clone(),
			clock.clone(),
			inbox,
			state_machine.clone(),
			inventory.clone(),
		));

		let tasks = Arc::new(BackgroundTasks {
			outbox: outbox_task(publisher.clone(), config.outbox.poll_interval()),
			cleanup: cleanup_task(
				storage.clone(),
				Duration::from_secs(config.storage.cleanup_interval_seconds),
			),
		});

		Self {
			config,
			storage,
			bus,
			clock,
			state_machine,
			idempotency,
			inventory,
			publisher,
			order_handler,
			payment_handler,
			tasks,
		}
	}

	/// Submits an order creation command under an idempotency key.
	pub async fn create_order(
		&self,
		idempotency_key: &str,
		command: CreateOrderCommand,
	) -> Result<CommandResponse<OrderReceipt>, OrderError> {
		self.order_handler
			.create_order(idempotency_key, command)
			.await
	}

	/// Handles an inbound payment notification.
	pub async fn handle_payment_notification(
		&self,
		notification: PaymentNotification,
	) -> Result<NotificationOutcome, PaymentError> {
		self.payment_handler.handle_notification(notification).await
	}

	pub async fn ship(
		&self,
		order_id: &str,
		tracking_number: &str,
	) -> Result<TransitionOutcome, OrderError> {
		self.order_handler.ship(order_id, tracking_number).await
	}

	pub async fn deliver(&self, order_id: &str) -> Result<TransitionOutcome, OrderError> {
		self.order_handler.deliver(order_id).await
	}

	pub async fn complete(&self, order_id: &str) -> Result<TransitionOutcome, OrderError> {
		self.order_handler.complete(order_id).await
	}

	pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<TransitionOutcome, OrderError> {
		self.order_handler.cancel(order_id, reason).await
	}

	pub async fn order(&self, order_id: &str) -> Result<Order, OrderError> {
		self.order_handler.get_order(order_id).await
	}

	/// Adds stock to a warehouse.
	pub async fn receive_stock(
		&self,
		sku: &str,
		warehouse: &str,
		quantity: u64,
	) -> Result<Stock, InventoryError> {
		self.inventory.receive(sku, warehouse, quantity).await
	}

	pub async fn stock(&self, sku: &str, warehouse: &str) -> Result<Option<Stock>, InventoryError> {
		self.inventory.stock(sku, warehouse).await
	}

	/// Runs one outbox publisher pass immediately.
	///
	/// Shares the single-flight guard with the background publisher: while a
	/// pass is running, the report comes back with `skipped` set.
	pub async fn publish_outbox(&self) -> Result<PublishReport, OutboxError> {
		self.publisher.run_once().await
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	pub fn bus(&self) -> &Arc<BusService> {
		&self.bus
	}

	pub fn clock(&self) -> &Arc<dyn Clock> {
		&self.clock
	}

	pub fn state_machine(&self) -> &Arc<OrderStateMachine> {
		&self.state_machine
	}

	pub fn idempotency(&self) -> &Arc<IdempotencyGateway> {
		&self.idempotency
	}

	pub fn inventory(&self) -> &Arc<InventoryLedger> {
		&self.inventory
	}
}

fn outbox_task(publisher: Arc<OutboxPublisher>, period: Duration) -> PeriodicTask {
	PeriodicTask::new("outbox-publisher", period, move || {
		let publisher = publisher.clone();
		async move {
			if let Err(e) = publisher.run_once().await {
				tracing::warn!(error = %e, "Outbox publisher run failed");
			}
		}
	})
}

fn cleanup_task(storage: Arc<StorageService>, period: Duration) -> PeriodicTask {
	PeriodicTask::new("storage-cleanup", period, move || {
		let storage = storage.clone();
		async move {
			match storage.cleanup_expired().await {
				Ok(count) if count > 0 => {
					tracing::debug!(removed = count, "Storage cleanup removed expired entries");
				},
				Ok(_) => {},
				Err(e) => {
					tracing::warn!(error = %e, "Storage cleanup failed");
				},
			}
		}
	})
}
