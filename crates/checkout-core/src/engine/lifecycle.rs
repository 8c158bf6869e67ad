//! Lifecycle management for the checkout engine.
//!
//! Handles startup of the background tasks, the main wait loop and their
//! shutdown.

use super::{CheckoutEngine, EngineError};

impl CheckoutEngine {
	/// Performs any initialization required before running.
	pub async fn initialize(&self) -> Result<(), EngineError> {
		tracing::info!(
			service = %self.config.service.id,
			storage = %self.config.storage.primary,
			bus = %self.config.bus.primary,
			"Initializing checkout engine"
		);
		Ok(())
	}

	/// Starts the outbox publisher and storage cleanup tasks.
	pub async fn start(&self) -> Result<(), EngineError> {
		for task in [&self.tasks.outbox, &self.tasks.cleanup] {
			if !task.start().await {
				return Err(EngineError::Service(format!(
					"Task {} is already running",
					task.name()
				)));
			}
		}
		Ok(())
	}

	/// Runs the background tasks until Ctrl-C, then shuts down.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.initialize().await?;
		self.start().await?;

		tokio::signal::ctrl_c()
			.await
			.map_err(|e| EngineError::Service(format!("Failed to listen for shutdown: {}", e)))?;
		tracing::info!("Shutdown signal received");

		self.shutdown().await
	}

	/// Stops the background tasks, then drains what is left in the outbox once.
	pub async fn shutdown(&self) -> Result<(), EngineError> {
		tracing::info!("Shutting down checkout engine");
		self.tasks.outbox.stop().await;
		self.tasks.cleanup.stop().await;

		match self.publisher.run_once().await {
			Ok(report) if report.failed > 0 => {
				tracing::warn!(
					published = report.published,
					"Outbox not fully drained, remaining events are published on next start"
				);
			},
			Ok(_) => {},
			Err(e) => tracing::warn!(error = %e, "Final outbox drain failed"),
		}
		Ok(())
	}
}
