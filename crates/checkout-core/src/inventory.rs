//! Inventory reservation ledger.
//!
//! Stock is held against an order by a reservation marker keyed by
//! (order, sku, warehouse) plus a matching increment of `Stock::reserved`.
//! The marker is the idempotency token of the hold: inserting it twice is a
//! no-op, and removing it either consumes the stock (`confirm_and_deduct`) or
//! gives it back (`release`). `reserved <= qty_on_hand` holds after every
//! committed unit.

use checkout_storage::{StorageError, StorageService, Transaction};
use checkout_types::{truncate_id, Clock, ReservationMarker, StorageTable, Stock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the inventory ledger.
#[derive(Debug, Error)]
pub enum InventoryError {
	#[error("Storage error: {0}")]
	Storage(String),
	/// Business failure: not enough available stock.
	#[error("Insufficient stock for {sku}@{warehouse}: requested {requested}, available {available}")]
	InsufficientStock {
		sku: String,
		warehouse: String,
		requested: u64,
		available: u64,
	},
	#[error("Quantity must be greater than zero")]
	InvalidQuantity,
	/// A marker exists but the stock row cannot absorb it.
	#[error("Ledger inconsistent for {0}")]
	Inconsistent(String),
}

impl From<StorageError> for InventoryError {
	fn from(e: StorageError) -> Self {
		InventoryError::Storage(e.to_string())
	}
}

/// Successful reservation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
	/// A new hold was placed.
	Reserved,
	/// The order already holds this sku/warehouse; nothing changed.
	AlreadyHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
	/// The held quantity was deducted from stock.
	Deducted { quantity: u64 },
	/// No hold exists (already confirmed or released); nothing changed.
	NotHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
	Released { quantity: u64 },
	NotHeld,
}

/// Sole writer of stock rows and reservation markers.
pub struct InventoryLedger {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
	reservation_ttl: Duration,
}

impl InventoryLedger {
	pub fn new(
		storage: Arc<StorageService>,
		clock: Arc<dyn Clock>,
		reservation_ttl: Duration,
	) -> Self {
		Self {
			storage,
			clock,
			reservation_ttl,
		}
	}

	/// Holds `quantity` units of `sku` in `warehouse` for `order_id`, as part of `tx`.
	///
	/// The stock row is read exclusively first so the availability check and
	/// the increment see one consistent `reserved`/`qty_on_hand` pair. On
	/// insufficient stock the marker is removed again and the stock row is
	/// left as it was.
	pub async fn reserve(
		&self,
		tx: &mut Transaction,
		order_id: &str,
		sku: &str,
		warehouse: &str,
		quantity: u64,
	) -> Result<ReserveOutcome, InventoryError> {
		if quantity == 0 {
			return Err(InventoryError::InvalidQuantity);
		}
		let stock_key = Stock::key(sku, warehouse);
		let insufficient = |available: u64| InventoryError::InsufficientStock {
			sku: sku.to_string(),
			warehouse: warehouse.to_string(),
			requested: quantity,
			available,
		};

		let Some(stock) = tx
			.get_for_update::<Stock>(StorageTable::Stock, &stock_key)
			.await?
		else {
			return Err(insufficient(0));
		};

		let now = self.clock.now();
		let marker = ReservationMarker {
			order_id: order_id.to_string(),
			sku: sku.to_string(),
			warehouse: warehouse.to_string(),
			quantity,
			created_at: now,
			expires_at: chrono::Duration::from_std(self.reservation_ttl)
				.ok()
				.and_then(|ttl| now.checked_add_signed(ttl))
				.unwrap_or(DateTime::<Utc>::MAX_UTC),
		};
		let marker_key = ReservationMarker::key(order_id, sku, warehouse);
		match tx
			.insert_unique(StorageTable::Reservations, &marker_key, &marker)
			.await
		{
			Ok(()) => {},
			Err(e) if e.is_duplicate() => {
				tracing::debug!(
					order_id = %truncate_id(order_id),
					stock = %stock_key,
					"Reservation already held"
				);
				return Ok(ReserveOutcome::AlreadyHeld);
			},
			Err(e) => return Err(e.into()),
		}

		let reserved = tx
			.update_where(
				StorageTable::Stock,
				&stock_key,
				|s: &Stock| s.available() >= quantity,
				|s| s.reserved += quantity,
			)
			.await?;
		if reserved.is_none() {
			tx.delete(StorageTable::Reservations, &marker_key).await?;
			tracing::debug!(
				order_id = %truncate_id(order_id),
				stock = %stock_key,
				requested = quantity,
				available = stock.available(),
				"Insufficient stock"
			);
			return Err(insufficient(stock.available()));
		}

		tracing::debug!(
			order_id = %truncate_id(order_id),
			stock = %stock_key,
			quantity,
			"Reserved stock"
		);
		Ok(ReserveOutcome::Reserved)
	}

	/// Consumes the hold of `order_id` on `sku`/`warehouse`, as part of `tx`.
	///
	/// Decrements both `reserved` and `qty_on_hand` by the held quantity and
	/// removes the marker. Without a marker this is a no-op.
	pub async fn confirm_and_deduct(
		&self,
		tx: &mut Transaction,
		order_id: &str,
		sku: &str,
		warehouse: &str,
	) -> Result<ConfirmOutcome, InventoryError> {
		let Some(quantity) = self
			.settle_hold(tx, order_id, sku, warehouse, true)
			.await?
		else {
			return Ok(ConfirmOutcome::NotHeld);
		};
		Ok(ConfirmOutcome::Deducted { quantity })
	}

	/// Gives the hold of `order_id` on `sku`/`warehouse` back, as part of `tx`.
	///
	/// Decrements `reserved` by the held quantity and removes the marker.
	/// Without a marker this is a no-op.
	pub async fn release(
		&self,
		tx: &mut Transaction,
		order_id: &str,
		sku: &str,
		warehouse: &str,
	) -> Result<ReleaseOutcome, InventoryError> {
		let Some(quantity) = self
			.settle_hold(tx, order_id, sku, warehouse, false)
			.await?
		else {
			return Ok(ReleaseOutcome::NotHeld);
		};
		Ok(ReleaseOutcome::Released { quantity })
	}

	/// Removes a marker and adjusts stock. Returns the held quantity, or
	/// `None` when no marker exists.
	async fn settle_hold(
		&self,
		tx: &mut Transaction,
		order_id: &str,
		sku: &str,
		warehouse: &str,
		deduct: bool,
	) -> Result<Option<u64>, InventoryError> {
		let marker_key = ReservationMarker::key(order_id, sku, warehouse);
		let Some(marker) = tx
			.get_for_update::<ReservationMarker>(StorageTable::Reservations, &marker_key)
			.await?
		else {
			tracing::debug!(
				order_id = %truncate_id(order_id),
				marker = %marker_key,
				"No reservation held"
			);
			return Ok(None);
		};

		let quantity = marker.quantity;
		let stock_key = Stock::key(sku, warehouse);
		let updated = tx
			.update_where(
				StorageTable::Stock,
				&stock_key,
				|s: &Stock| s.reserved >= quantity && (!deduct || s.qty_on_hand >= quantity),
				|s| {
					s.reserved -= quantity;
					if deduct {
						s.qty_on_hand -= quantity;
					}
				},
			)
			.await?;
		if updated.is_none() {
			return Err(InventoryError::Inconsistent(stock_key));
		}

		let removed = tx
			.delete_where(
				StorageTable::Reservations,
				&marker_key,
				|m: &ReservationMarker| *m == marker,
			)
			.await?;
		if removed == 0 {
			return Err(InventoryError::Inconsistent(marker_key));
		}

		tracing::debug!(
			order_id = %truncate_id(order_id),
			stock = %stock_key,
			quantity,
			deducted = deduct,
			"Settled reservation"
		);
		Ok(Some(quantity))
	}

	/// Markers currently held by `order_id`.
	pub async fn reservations_for(
		&self,
		tx: &mut Transaction,
		order_id: &str,
	) -> Result<Vec<ReservationMarker>, InventoryError> {
		Ok(tx
			.query(
				StorageTable::Reservations,
				|m: &ReservationMarker| m.order_id == order_id,
				usize::MAX,
			)
			.await?)
	}

	/// Confirms every hold of `order_id`. Returns the number of holds deducted.
	pub async fn confirm_all(
		&self,
		tx: &mut Transaction,
		order_id: &str,
	) -> Result<usize, InventoryError> {
		let mut confirmed = 0;
		for marker in self.reservations_for(tx, order_id).await? {
			let outcome = self
				.confirm_and_deduct(tx, order_id, &marker.sku, &marker.warehouse)
				.await?;
			if matches!(outcome, ConfirmOutcome::Deducted { .. }) {
				confirmed += 1;
			}
		}
		Ok(confirmed)
	}

	/// Releases every hold of `order_id`. Returns the number of holds released.
	pub async fn release_all(
		&self,
		tx: &mut Transaction,
		order_id: &str,
	) -> Result<usize, InventoryError> {
		let mut released = 0;
		for marker in self.reservations_for(tx, order_id).await? {
			let outcome = self
				.release(tx, order_id, &marker.sku, &marker.warehouse)
				.await?;
			if matches!(outcome, ReleaseOutcome::Released { .. }) {
				released += 1;
			}
		}
		Ok(released)
	}

	/// Adds `quantity` units to the on-hand stock, creating the row if needed.
	pub async fn receive(
		&self,
		sku: &str,
		warehouse: &str,
		quantity: u64,
	) -> Result<Stock, InventoryError> {
		if quantity == 0 {
			return Err(InventoryError::InvalidQuantity);
		}
		let key = Stock::key(sku, warehouse);
		let mut tx = self.storage.begin().await?;

		let stock = match tx.get_for_update::<Stock>(StorageTable::Stock, &key).await? {
			None => {
				let stock = Stock {
					sku: sku.to_string(),
					warehouse: warehouse.to_string(),
					qty_on_hand: quantity,
					reserved: 0,
				};
				tx.insert_unique(StorageTable::Stock, &key, &stock).await?;
				stock
			},
			Some(current) => tx
				.update_where(
					StorageTable::Stock,
					&key,
					|s: &Stock| *s == current,
					|s| s.qty_on_hand += quantity,
				)
				.await?
				.ok_or_else(|| InventoryError::Inconsistent(key.clone()))?,
		};
		tx.commit().await?;

		tracing::info!(stock = %key, quantity, on_hand = stock.qty_on_hand, "Received stock");
		Ok(stock)
	}

	pub async fn stock(&self, sku: &str, warehouse: &str) -> Result<Option<Stock>, InventoryError> {
		Ok(self
			.storage
			.find(StorageTable::Stock, &Stock::key(sku, warehouse))
			.await?)
	}

	/// Markers whose hold expired at `now`, for an external reaper.
	pub async fn expired_reservations(
		&self,
		now: DateTime<Utc>,
		limit: usize,
	) -> Result<Vec<ReservationMarker>, InventoryError> {
		Ok(self
			.storage
			.query(
				StorageTable::Reservations,
				|m: &ReservationMarker| m.is_expired(now),
				limit,
			)
			.await?)
	}
}
