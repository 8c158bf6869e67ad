//! Shared fixtures for unit tests.

use crate::handlers::{OrderHandler, PaymentHandler};
use crate::idempotency::IdempotencyGateway;
use crate::inbox::Inbox;
use crate::inventory::InventoryLedger;
use crate::outbox::OutboxPublisher;
use crate::state::OrderStateMachine;
use checkout_bus::implementations::memory::MemoryBus;
use checkout_bus::BusService;
use async_trait::async_trait;
use checkout_storage::implementations::memory::MemoryStorage;
use checkout_storage::{StorageError, StorageInterface, StorageService, UnitOfWork};
use checkout_types::{
	Clock, ConfigSchema, ManualClock, Order, OrderEventType, OrderLine, OrderStatus, OutboxEvent,
	ReceiverSnapshot, StorageTable,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Reservation TTL used by [`Harness::inventory`].
pub const RESERVATION_TTL: Duration = Duration::from_secs(900);

/// Memory storage, a memory bus and a manual clock wired together.
pub struct Harness {
	pub storage: Arc<StorageService>,
	pub clock: Arc<ManualClock>,
	pub bus: MemoryBus,
}

impl Harness {
	pub fn new() -> Self {
		let clock = Arc::new(ManualClock::default());
		let backend = MemoryStorage::with_clock(clock.clone());
		Self::with_backend(clock, Box::new(backend))
	}

	/// Harness whose units fail to commit once they updated a row of `table`.
	pub fn failing_updates_of(table: StorageTable) -> Self {
		let clock = Arc::new(ManualClock::default());
		let backend = FailingUpdates {
			inner: MemoryStorage::with_clock(clock.clone()),
			table,
		};
		Self::with_backend(clock, Box::new(backend))
	}

	fn with_backend(clock: Arc<ManualClock>, backend: Box<dyn StorageInterface>) -> Self {
		Self {
			storage: Arc::new(StorageService::new(backend)),
			clock,
			bus: MemoryBus::new(),
		}
	}

	pub fn now(&self) -> DateTime<Utc> {
		self.clock.now()
	}

	pub fn clock(&self) -> Arc<dyn Clock> {
		self.clock.clone()
	}

	pub fn state_machine(&self) -> OrderStateMachine {
		OrderStateMachine::new(self.storage.clone(), self.clock())
	}

	pub fn idempotency(&self) -> IdempotencyGateway {
		IdempotencyGateway::new(self.storage.clone(), self.clock(), None)
	}

	pub fn inbox(&self) -> Inbox {
		Inbox::new(self.storage.clone(), self.clock())
	}

	pub fn inventory(&self) -> InventoryLedger {
		InventoryLedger::new(self.storage.clone(), self.clock(), RESERVATION_TTL)
	}

	pub fn publisher(&self, batch_size: usize) -> OutboxPublisher {
		OutboxPublisher::new(
			self.storage.clone(),
			Arc::new(BusService::new(Box::new(self.bus.clone()))),
			self.clock(),
			batch_size,
		)
	}

	pub fn order_handler(&self) -> OrderHandler {
		OrderHandler::new(
			self.storage.clone(),
			self.clock(),
			Arc::new(self.idempotency()),
			Arc::new(self.state_machine()),
			Arc::new(self.inventory()),
		)
	}

	pub fn payment_handler(&self) -> PaymentHandler {
		PaymentHandler::new(
			self.storage.clone(),
			self.clock(),
			Arc::new(self.inbox()),
			Arc::new(self.state_machine()),
			Arc::new(self.inventory()),
		)
	}

	pub async fn insert_order(&self, order: Order) -> Order {
		let mut tx = self.storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::Orders, &order.id, &order)
			.await
			.unwrap();
		tx.commit().await.unwrap();
		order
	}

	/// Every outbox row in sequence order.
	pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
		self.storage
			.query(StorageTable::Outbox, |_: &OutboxEvent| true, usize::MAX)
			.await
			.unwrap()
	}

	pub async fn events_of(&self, order_id: &str, event_type: OrderEventType) -> Vec<OutboxEvent> {
		self.outbox_events()
			.await
			.into_iter()
			.filter(|e| e.aggregate_id == order_id && e.event_type == event_type.as_str())
			.collect()
	}
}

/// A pending single-line order owing `amount`.
pub fn pending_order(id: &str, amount: Decimal) -> Order {
	Order {
		id: id.to_string(),
		buyer_id: "buyer-1".to_string(),
		status: OrderStatus::Pending,
		payable_amount: amount,
		paid_amount: None,
		pay_trade_ref: None,
		tracking_number: None,
		cancel_reason: None,
		lines: vec![OrderLine {
			sku: "sku-1".to_string(),
			warehouse: "wh-1".to_string(),
			quantity: 1,
			unit_price: amount,
		}],
		receiver: receiver(),
		created_at: DateTime::<Utc>::UNIX_EPOCH,
		paid_at: None,
		shipped_at: None,
		delivered_at: None,
		completed_at: None,
		canceled_at: None,
	}
}

pub fn receiver() -> ReceiverSnapshot {
	ReceiverSnapshot {
		name: "Ada".to_string(),
		phone: "555-0100".to_string(),
		address: "1 Main St".to_string(),
	}
}

/// Memory storage whose units refuse to commit after a conditional update
/// of one table.
struct FailingUpdates {
	inner: MemoryStorage,
	table: StorageTable,
}

#[async_trait]
impl StorageInterface for FailingUpdates {
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
		Ok(Box::new(FailingUnit {
			inner: self.inner.begin().await?,
			table: self.table,
			updated: false,
		}))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		self.inner.config_schema()
	}
}

struct FailingUnit {
	inner: Box<dyn UnitOfWork>,
	table: StorageTable,
	updated: bool,
}

#[async_trait]
impl UnitOfWork for FailingUnit {
	async fn get(&mut self, table: StorageTable, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		self.inner.get(table, key).await
	}

	async fn lock(&mut self, table: StorageTable, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		self.inner.lock(table, key).await
	}

	async fn insert(
		&mut self,
		table: StorageTable,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		self.inner.insert(table, key, value, ttl).await
	}

	async fn compare_and_swap(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<u64, StorageError> {
		self.updated |= table == self.table;
		self.inner.compare_and_swap(table, key, expected, value).await
	}

	async fn compare_and_delete(
		&mut self,
		table: StorageTable,
		key: &str,
		expected: &[u8],
	) -> Result<u64, StorageError> {
		self.inner.compare_and_delete(table, key, expected).await
	}

	async fn delete(&mut self, table: StorageTable, key: &str) -> Result<u64, StorageError> {
		self.inner.delete(table, key).await
	}

	async fn scan(
		&mut self,
		table: StorageTable,
		start_after: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		self.inner.scan(table, start_after, limit).await
	}

	async fn next_sequence(&mut self, table: StorageTable) -> Result<u64, StorageError> {
		self.inner.next_sequence(table).await
	}

	async fn commit(&mut self) -> Result<(), StorageError> {
		if self.updated {
			self.inner.rollback().await?;
			return Err(StorageError::Backend(format!("commit refused for {}", self.table)));
		}
		self.inner.commit().await
	}

	async fn rollback(&mut self) -> Result<(), StorageError> {
		self.inner.rollback().await
	}
}
