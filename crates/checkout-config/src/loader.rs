//! Configuration loader for configurations split across several files.
//!
//! The main file may name other files in an `include` directive. Included
//! files are merged section by section; a top-level section may only be
//! defined once across all files, and a file may only be loaded once.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Configuration loader that handles multi-file configurations with includes.
pub struct ConfigLoader {
	/// Base path for resolving relative includes
	base_path: PathBuf,
	/// Track loaded files to prevent circular includes
	loaded_files: HashSet<PathBuf>,
	/// Which file defined each top-level section, for error reporting
	section_sources: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			loaded_files: HashSet::new(),
			section_sources: HashMap::new(),
		}
	}

	/// Loads a configuration file and all its includes.
	pub async fn load_config(&mut self, config_path: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let config_path = self.resolve_path(config_path)?;
		let mut combined = self.load_table(&config_path).await?;
		let includes = Self::extract_includes(&mut combined)?;
		self.record_sections(&combined, &config_path)?;

		for include in includes {
			let include_path = self.resolve_path(&include)?;
			let table = self.load_table(&include_path).await?;
			if table.contains_key("include") {
				return Err(ConfigError::Validation(format!(
					"Nested include in {} is not supported",
					include_path.display()
				)));
			}
			self.record_sections(&table, &include_path)?;
			combined.extend(table);
		}

		let config: Config = toml::Value::Table(combined).try_into()?;
		config.validate()?;
		Ok(config)
	}

	/// Reads a file, resolves environment variables and parses it as a table.
	async fn load_table(&mut self, path: &Path) -> Result<toml::Table, ConfigError> {
		let canonical_path = path.canonicalize().map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Cannot resolve path {}: {}", path.display(), e),
			))
		})?;
		if !self.loaded_files.insert(canonical_path.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical_path.display()
			)));
		}

		let content = tokio::fs::read_to_string(path).await?;
		let resolved = resolve_env_vars(&content)?;
		Ok(toml::from_str(&resolved)?)
	}

	/// Removes the include directive from `table` and returns the paths it named.
	fn extract_includes(table: &mut toml::Table) -> Result<Vec<PathBuf>, ConfigError> {
		match table.remove("include") {
			None => Ok(Vec::new()),
			Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
			Some(toml::Value::Array(items)) => items
				.into_iter()
				.map(|item| match item {
					toml::Value::String(path) => Ok(PathBuf::from(path)),
					_ => Err(ConfigError::Validation(
						"Include array must contain only strings".into(),
					)),
				})
				.collect(),
			Some(_) => Err(ConfigError::Validation(
				"Include must be a string or array of strings".into(),
			)),
		}
	}

	fn record_sections(&mut self, table: &toml::Table, source: &Path) -> Result<(), ConfigError> {
		for key in table.keys() {
			if let Some(existing_source) = self.section_sources.get(key) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}. \
					Each top-level section must be unique across all configuration files.",
					key,
					existing_source.display(),
					source.display()
				)));
			}
			self.section_sources.insert(key.clone(), source.to_path_buf());
		}
		Ok(())
	}

	/// Resolves a path relative to the base path.
	fn resolve_path(&self, path: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
		let path = path.as_ref();
		let resolved = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.base_path.join(path)
		};

		if !resolved.exists() {
			return Err(ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}", resolved.display()),
			)));
		}
		Ok(resolved)
	}
}
