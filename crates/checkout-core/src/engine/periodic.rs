//! Explicit timer loop for background jobs.
//!
//! A [`PeriodicTask`] runs its job once per period until stopped. Runs never
//! overlap: a tick or manual trigger that arrives while a run is in flight is
//! skipped, and ticks missed during a long run are delayed rather than fired
//! in a burst.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Job executed by a periodic task.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct PeriodicTask {
	name: &'static str,
	period: Duration,
	job: Job,
	/// Set while a run is in flight.
	in_flight: Arc<AtomicBool>,
	/// Stop channel and loop handle of a started task.
	running: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

/// Clears the in-flight flag when a run ends, even by panic.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Runs `job` unless a run is already in flight. Returns whether it ran.
async fn run_single_flight(name: &'static str, job: &Job, in_flight: &Arc<AtomicBool>) -> bool {
	if in_flight
		.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
		.is_err()
	{
		tracing::debug!(task = name, "Run already in flight, skipping");
		return false;
	}
	let _guard = FlightGuard(in_flight.clone());
	job().await;
	true
}

impl PeriodicTask {
	pub fn new<F, Fut>(name: &'static str, period: Duration, job: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let job: Job = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(job()) });
		Self {
			name,
			period,
			job,
			in_flight: Arc::new(AtomicBool::new(false)),
			running: Mutex::new(None),
		}
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	/// Starts the timer loop. The first run happens one period from now.
	///
	/// Returns `false` if the task was already started.
	pub async fn start(&self) -> bool {
		let mut running = self.running.lock().await;
		if running.is_some() {
			return false;
		}

		let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
		let name = self.name;
		let period = self.period;
		let job = self.job.clone();
		let in_flight = self.in_flight.clone();

		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
			// The first tick completes immediately.
			interval.tick().await;

			loop {
				tokio::select! {
					_ = interval.tick() => {
						run_single_flight(name, &job, &in_flight).await;
					}
					_ = stop_rx.recv() => {
						break;
					}
				}
			}
			tracing::debug!(task = name, "Periodic task stopped");
		});

		*running = Some((stop_tx, handle));
		tracing::info!(task = name, period_ms = period.as_millis() as u64, "Started periodic task");
		true
	}

	/// Runs the job now unless a run is already in flight.
	pub async fn trigger(&self) -> bool {
		run_single_flight(self.name, &self.job, &self.in_flight).await
	}

	/// Stops the timer loop, waiting for an in-flight run to finish.
	pub async fn stop(&self) {
		let Some((stop_tx, handle)) = self.running.lock().await.take() else {
			return;
		};
		let _ = stop_tx.send(()).await;
		if let Err(e) = handle.await {
			tracing::warn!(task = self.name, error = %e, "Periodic task ended abnormally");
		}
	}

	pub async fn is_started(&self) -> bool {
		self.running.lock().await.is_some()
	}
}
