//! Main entry point for the checkout service.
//!
//! Loads the configuration, builds the checkout engine from the configured
//! storage and bus implementations, and runs its background tasks (outbox
//! publication and storage cleanup) until interrupted.

use clap::Parser;
use checkout_config::Config;
use std::path::PathBuf;

mod factory_registry;

/// Command-line arguments for the checkout service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "CHECKOUT_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started checkout service");

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Invalid config path: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;
	tracing::info!(service = %config.service.id, "Loaded configuration");

	let engine = factory_registry::build_engine(config)?;
	engine.run().await?;

	tracing::info!("Stopped checkout service");
	Ok(())
}
