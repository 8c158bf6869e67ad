//! Configuration module for the checkout system.
//!
//! This module provides structures and utilities for managing checkout
//! configuration. It supports loading configuration from TOML files and
//! validates every section before the engine is built.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

pub mod builders;
mod loader;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use builders::config::ConfigBuilder;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the checkout service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this service instance.
	pub service: ServiceConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Configuration for the outbound message bus.
	pub bus: BusConfig,
	/// Outbox publisher settings.
	#[serde(default)]
	pub outbox: OutboxConfig,
	/// Idempotency record settings.
	#[serde(default)]
	pub idempotency: IdempotencyConfig,
	/// Inventory reservation settings.
	#[serde(default)]
	pub inventory: InventoryConfig,
}

/// Configuration specific to the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this instance, used in logs.
	pub id: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	3600
}

/// Configuration for the message bus outbox events are forwarded to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of bus implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Outbox publisher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
	/// Delay between publisher runs in milliseconds.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	/// Maximum number of events forwarded per run.
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
}

fn default_poll_interval_ms() -> u64 {
	500
}

fn default_batch_size() -> usize {
	100
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: default_poll_interval_ms(),
			batch_size: default_batch_size(),
		}
	}
}

impl OutboxConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}
}

/// Idempotency record settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
	/// Lifetime of an idempotency record. 0 keeps records forever.
	#[serde(default = "default_idempotency_ttl_seconds")]
	pub ttl_seconds: u64,
}

fn default_idempotency_ttl_seconds() -> u64 {
	86400
}

impl Default for IdempotencyConfig {
	fn default() -> Self {
		Self {
			ttl_seconds: default_idempotency_ttl_seconds(),
		}
	}
}

impl IdempotencyConfig {
	/// Record lifetime, or `None` when records never expire.
	pub fn ttl(&self) -> Option<Duration> {
		(self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
	}
}

/// Inventory reservation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InventoryConfig {
	/// How long a hold stays valid before the reaper may release it.
	#[serde(default = "default_reservation_ttl_seconds")]
	pub reservation_ttl_seconds: u64,
}

fn default_reservation_ttl_seconds() -> u64 {
	900
}

impl Default for InventoryConfig {
	fn default() -> Self {
		Self {
			reservation_ttl_seconds: default_reservation_ttl_seconds(),
		}
	}
}

impl InventoryConfig {
	pub fn reservation_ttl(&self) -> Duration {
		Duration::from_secs(self.reservation_ttl_seconds)
	}
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB to prevent ReDoS attacks.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last = 0;
	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (std::env::var(var_name.as_str()), cap.get(2)) {
			(Ok(v), _) => v,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					var_name.as_str()
				)));
			},
		};
		result.push_str(&input[last..full_match.start()]);
		result.push_str(&value);
		last = full_match.end();
	}
	result.push_str(&input[last..]);

	Ok(result)
}

fn validate_implementations(
	section: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
) -> Result<(), ConfigError> {
	if implementations.is_empty() {
		return Err(ConfigError::Validation(format!(
			"At least one {} implementation must be configured",
			section
		)));
	}
	if primary.is_empty() {
		return Err(ConfigError::Validation(format!(
			"{} primary implementation cannot be empty",
			section
		)));
	}
	if !implementations.contains_key(primary) {
		return Err(ConfigError::Validation(format!(
			"Primary {} '{}' not found in implementations",
			section, primary
		)));
	}
	Ok(())
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	///
	/// Each top-level section must be unique across all configuration files.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates the configuration to ensure all required fields are properly set.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		validate_implementations(
			"storage",
			&self.storage.primary,
			&self.storage.implementations,
		)?;
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.storage.cleanup_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		validate_implementations("bus", &self.bus.primary, &self.bus.implementations)?;

		if self.outbox.poll_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"Outbox poll_interval_ms must be greater than 0".into(),
			));
		}
		if !(1..=10_000).contains(&self.outbox.batch_size) {
			return Err(ConfigError::Validation(
				"Outbox batch_size must be between 1 and 10000".into(),
			));
		}

		if self.inventory.reservation_ttl_seconds == 0 {
			return Err(ConfigError::Validation(
				"Inventory reservation_ttl_seconds must be greater than 0".into(),
			));
		}

		Ok(())
	}
}

/// Parses a TOML string, resolving environment variables and validating the
/// result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
