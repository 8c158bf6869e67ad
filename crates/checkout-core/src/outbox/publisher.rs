//! Outbox publisher.
//!
//! Drains unpublished events to the message bus in sequence order. An event is
//! marked published only after the bus accepted it, so a crash in between
//! results in redelivery, never in a lost event. Runs are single-flight: a run
//! requested while another is in progress is skipped, so no event is handed
//! to the bus twice by overlapping runs.

use super::{outbox_key, OutboxError};
use checkout_bus::BusService;
use checkout_storage::StorageService;
use checkout_types::{Clock, OutboxEvent, PublishedEvent, StorageTable};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of one publisher run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
	/// Events accepted by the bus and marked published.
	pub published: usize,
	/// Events the bus refused in this run (0 or 1; the run stops there).
	pub failed: usize,
	/// Another run was in progress, so this one did nothing.
	pub skipped: bool,
}

/// Forwards unpublished outbox events to the bus.
pub struct OutboxPublisher {
	storage: Arc<StorageService>,
	bus: Arc<BusService>,
	clock: Arc<dyn Clock>,
	batch_size: usize,
	/// Held for the duration of a run.
	running: Mutex<()>,
}

impl OutboxPublisher {
	pub fn new(
		storage: Arc<StorageService>,
		bus: Arc<BusService>,
		clock: Arc<dyn Clock>,
		batch_size: usize,
	) -> Self {
		Self {
			storage,
			bus,
			clock,
			batch_size,
			running: Mutex::new(()),
		}
	}

	/// Oldest unpublished events, at most one batch.
	async fn pending_batch(&self) -> Result<Vec<OutboxEvent>, OutboxError> {
		let mut tx = self.storage.begin().await?;
		let ids: Vec<u64> = tx
			.query(StorageTable::OutboxPending, |_: &u64| true, self.batch_size)
			.await?;

		let mut events = Vec::with_capacity(ids.len());
		for id in ids {
			let key = outbox_key(id);
			match tx.get::<OutboxEvent>(StorageTable::Outbox, &key).await? {
				Some(event) if !event.published => events.push(event),
				_ => {
					tracing::warn!(event_id = id, "Dropping stale pending outbox entry");
					tx.delete(StorageTable::OutboxPending, &key).await?;
				},
			}
		}
		tx.commit().await?;
		Ok(events)
	}

	/// Publishes at most one batch of the oldest unpublished events.
	///
	/// The run stops at the first event the bus refuses so that events of one
	/// aggregate are never delivered out of order. The refused event stays
	/// unpublished and is retried by the next run.
	pub async fn run_once(&self) -> Result<PublishReport, OutboxError> {
		let Ok(_running) = self.running.try_lock() else {
			tracing::debug!("Outbox run already in progress, skipping");
			return Ok(PublishReport {
				skipped: true,
				..PublishReport::default()
			});
		};
		let pending = self.pending_batch().await?;

		let mut report = PublishReport::default();
		for event in pending {
			if let Err(e) = self.bus.publish(&PublishedEvent::from(&event)).await {
				tracing::warn!(
					event_id = event.id,
					event_type = %event.event_type,
					error = %e,
					"Failed to publish outbox event, will retry"
				);
				report.failed += 1;
				break;
			}

			let now = self.clock.now();
			let key = outbox_key(event.id);
			let mut tx = self.storage.begin().await?;
			let marked = tx
				.update_where(
					StorageTable::Outbox,
					&key,
					|e: &OutboxEvent| !e.published,
					|e| {
						e.published = true;
						e.published_at = Some(now);
					},
				)
				.await?;
			tx.delete(StorageTable::OutboxPending, &key).await?;
			tx.commit().await?;

			if marked.is_none() {
				tracing::debug!(event_id = event.id, "Outbox event was already marked published");
			}
			report.published += 1;
		}

		if report.published > 0 || report.failed > 0 {
			tracing::info!(
				published = report.published,
				failed = report.failed,
				"Outbox run finished"
			);
		}
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::outbox::append;
	use crate::test_support::Harness;
	use checkout_types::NewOutboxEvent;

	async fn seed(h: &Harness, count: usize) {
		let mut tx = h.storage.begin().await.unwrap();
		for i in 0..count {
			append(
				&mut tx,
				NewOutboxEvent {
					aggregate_type: "order".into(),
					aggregate_id: format!("o{}", i),
					event_type: "OrderCreated".into(),
					payload: serde_json::json!({ "n": i }),
				},
				h.now(),
			)
			.await
			.unwrap();
		}
		tx.commit().await.unwrap();
	}

	#[tokio::test]
	async fn test_publishes_oldest_first_in_batches() {
		let h = Harness::new();
		seed(&h, 5).await;
		let publisher = h.publisher(3);

		let report = publisher.run_once().await.unwrap();
		assert_eq!(report.published, 3);
		let report = publisher.run_once().await.unwrap();
		assert_eq!(report.published, 2);
		let report = publisher.run_once().await.unwrap();
		assert_eq!(report, PublishReport::default());

		let ids: Vec<u64> = h.bus.published().iter().map(|e| e.event_id).collect();
		assert_eq!(ids, vec![1, 2, 3, 4, 5]);
		assert!(h
			.outbox_events()
			.await
			.iter()
			.all(|e| e.published && e.published_at == Some(h.now())));
	}

	#[tokio::test]
	async fn test_bus_failure_leaves_events_unpublished() {
		let h = Harness::new();
		seed(&h, 2).await;
		let publisher = h.publisher(10);

		h.bus.set_failing(true);
		let report = publisher.run_once().await.unwrap();
		assert_eq!((report.published, report.failed), (0, 1));
		assert!(h.outbox_events().await.iter().all(|e| !e.published));

		h.bus.set_failing(false);
		let report = publisher.run_once().await.unwrap();
		assert_eq!(report.published, 2);
		assert_eq!(h.bus.published().len(), 2);
	}

	#[tokio::test]
	async fn test_events_are_retained_after_publication() {
		let h = Harness::new();
		seed(&h, 1).await;
		h.publisher(10).run_once().await.unwrap();
		assert_eq!(h.outbox_events().await.len(), 1);
	}

	async fn pending(h: &Harness) -> Vec<u64> {
		h.storage
			.query(StorageTable::OutboxPending, |_: &u64| true, usize::MAX)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn test_published_events_leave_the_pending_index() {
		let h = Harness::new();
		seed(&h, 300).await;
		let publisher = h.publisher(300);

		assert_eq!(publisher.run_once().await.unwrap().published, 300);
		assert!(pending(&h).await.is_empty());

		seed(&h, 1).await;
		assert_eq!(pending(&h).await, vec![301]);
		assert_eq!(publisher.run_once().await.unwrap().published, 1);
		assert_eq!(h.bus.published().last().map(|e| e.event_id), Some(301));
		assert_eq!(h.outbox_events().await.len(), 301);
	}

	#[tokio::test]
	async fn test_stale_pending_entry_is_dropped() {
		let h = Harness::new();
		let mut tx = h.storage.begin().await.unwrap();
		tx.insert_unique(StorageTable::OutboxPending, &outbox_key(7), &7u64)
			.await
			.unwrap();
		tx.commit().await.unwrap();
		seed(&h, 1).await;

		let report = h.publisher(10).run_once().await.unwrap();
		assert_eq!(report.published, 1);
		assert!(pending(&h).await.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_overlapping_run_is_skipped() {
		let h = Harness::new();
		seed(&h, 1).await;
		h.bus.set_delay(std::time::Duration::from_millis(50));
		let publisher = h.publisher(10);

		let (first, second) = tokio::join!(publisher.run_once(), publisher.run_once());
		let mut reports = [first.unwrap(), second.unwrap()];
		reports.sort_by_key(|r| r.skipped);
		assert_eq!(reports[0].published, 1);
		assert!(reports[1].skipped);
		assert_eq!(reports[1].published, 0);
		assert_eq!(h.bus.published().len(), 1);

		assert_eq!(publisher.run_once().await.unwrap(), PublishReport::default());
	}
}
