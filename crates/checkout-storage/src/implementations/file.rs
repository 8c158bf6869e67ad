//! File-backed storage implementation.
//!
//! Tables are held by the same engine as the memory backend. Durable state is
//! `snapshot.json` plus `journal.log`. Every committing unit appends one
//! journal line holding the final image of each row it touched, in all
//! tables, and the line is synced before the commit returns. A unit is
//! therefore on disk entirely or not at all. Opening the storage loads the
//! snapshot, replays the journal and drops an incomplete last line. Once
//! `compact_after` records have accumulated the snapshot is rewritten (temp
//! file, then rename) and the journal truncated. A lock file keeps a second
//! process from opening the same directory.

use crate::engine::{Change, CommitSink, Engine, Row, TableRows, Tables};
use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry, UnitOfWork};
use async_trait::async_trait;
use checkout_types::{
	Clock, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, StorageTable,
	ValidationError,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LOCK_FILE: &str = ".checkout.lock";
const SNAPSHOT_FILE: &str = "snapshot.json";
const JOURNAL_FILE: &str = "journal.log";
const DEFAULT_COMPACT_AFTER: usize = 1000;

fn backend(e: std::io::Error) -> StorageError {
	StorageError::Backend(e.to_string())
}

fn serialization(e: serde_json::Error) -> StorageError {
	StorageError::Serialization(e.to_string())
}

/// On-disk shape of a row. Values are stored as JSON documents so the files
/// stay readable.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRow {
	value: serde_json::Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	expires_at: Option<DateTime<Utc>>,
}

impl PersistedRow {
	fn from_row(row: &Row) -> Result<Self, StorageError> {
		Ok(Self {
			value: serde_json::from_slice(&row.value).map_err(serialization)?,
			expires_at: row.expires_at,
		})
	}

	fn into_row(self) -> Result<Row, StorageError> {
		Ok(Row {
			value: serde_json::to_vec(&self.value).map_err(serialization)?,
			expires_at: self.expires_at,
		})
	}
}

/// One row of a journal record; `row: None` removes the key.
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
	table: String,
	key: String,
	#[serde(default)]
	row: Option<PersistedRow>,
}

type Snapshot = BTreeMap<String, BTreeMap<String, PersistedRow>>;

fn parse_table(name: &str) -> Result<StorageTable, StorageError> {
	name.parse()
		.map_err(|_| StorageError::Serialization(format!("unknown table '{}'", name)))
}

fn snapshot_bytes(tables: &Tables) -> Result<Vec<u8>, StorageError> {
	let mut snapshot = BTreeMap::new();
	for (table, rows) in tables.rows() {
		if rows.is_empty() {
			continue;
		}
		let mut persisted = BTreeMap::new();
		for (key, row) in rows {
			persisted.insert(key.as_str(), PersistedRow::from_row(row)?);
		}
		snapshot.insert(table.as_str(), persisted);
	}
	serde_json::to_vec_pretty(&snapshot).map_err(serialization)
}

/// State rebuilt from disk when the storage is opened.
struct Recovered {
	rows: HashMap<StorageTable, TableRows>,
	/// Length of the journal up to its last complete record.
	journal_len: u64,
	records: usize,
}

fn recover(base_path: &Path) -> Result<Recovered, StorageError> {
	let mut rows: HashMap<StorageTable, TableRows> = HashMap::new();

	let snapshot_path = base_path.join(SNAPSHOT_FILE);
	match std::fs::read(&snapshot_path) {
		Ok(data) => {
			let snapshot: Snapshot = serde_json::from_slice(&data).map_err(|e| {
				StorageError::Serialization(format!("{}: {}", snapshot_path.display(), e))
			})?;
			for (name, persisted) in snapshot {
				let table_rows = rows.entry(parse_table(&name)?).or_default();
				for (key, row) in persisted {
					table_rows.insert(key, row.into_row()?);
				}
			}
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
		Err(e) => return Err(backend(e)),
	}

	let journal = match std::fs::read(base_path.join(JOURNAL_FILE)) {
		Ok(data) => data,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
		Err(e) => return Err(backend(e)),
	};
	let mut journal_len = 0;
	let mut records = 0;
	for line in journal.split_inclusive(|b| *b == b'\n') {
		let Some(record) = line.strip_suffix(b"\n") else {
			tracing::warn!(bytes = line.len(), "Discarding incomplete journal record");
			break;
		};
		let entries: Vec<JournalEntry> = serde_json::from_slice(record).map_err(|e| {
			StorageError::Serialization(format!("journal record {}: {}", records + 1, e))
		})?;
		for entry in entries {
			let table_rows = rows.entry(parse_table(&entry.table)?).or_default();
			match entry.row {
				Some(row) => {
					table_rows.insert(entry.key, row.into_row()?);
				},
				None => {
					table_rows.remove(&entry.key);
				},
			}
		}
		journal_len += line.len() as u64;
		records += 1;
	}

	for (table, table_rows) in &rows {
		tracing::debug!(table = %table, rows = table_rows.len(), "Loaded table");
	}
	Ok(Recovered {
		rows,
		journal_len,
		records,
	})
}

/// Open journal file and the bookkeeping needed to append to it.
struct Journal {
	file: fs::File,
	/// Bytes of complete records.
	len: u64,
	records: usize,
	/// Set when a failed append could not be cut off again.
	poisoned: bool,
}

impl Journal {
	async fn append(&mut self, line: &[u8]) -> Result<(), StorageError> {
		self.file.write_all(line).await.map_err(backend)?;
		self.file.flush().await.map_err(backend)?;
		self.file.sync_data().await.map_err(backend)?;
		self.len += line.len() as u64;
		self.records += 1;
		Ok(())
	}

	/// Cuts a partially written record so later records stay readable.
	async fn discard_tail(&mut self) {
		if let Err(e) = self.file.set_len(self.len).await {
			tracing::error!(error = %e, "Failed to cut a partial journal record");
			self.poisoned = true;
		}
	}
}

/// Appends each committing unit to the journal.
struct JournalSink {
	base_path: PathBuf,
	compact_after: usize,
	journal: Mutex<Journal>,
}

impl JournalSink {
	/// Rewrites the snapshot from `tables` and empties the journal.
	async fn compact(&self, journal: &mut Journal, tables: &Tables) -> Result<(), StorageError> {
		let bytes = snapshot_bytes(tables)?;
		let path = self.base_path.join(SNAPSHOT_FILE);
		let temp_path = path.with_extension("tmp");

		let mut file = fs::File::create(&temp_path).await.map_err(backend)?;
		file.write_all(&bytes).await.map_err(backend)?;
		file.flush().await.map_err(backend)?;
		file.sync_all().await.map_err(backend)?;
		fs::rename(&temp_path, &path).await.map_err(backend)?;

		// Replaying the old journal over the new snapshot yields the same
		// tables, so a crash before the truncation is harmless.
		journal.file.set_len(0).await.map_err(backend)?;
		journal.file.sync_data().await.map_err(backend)?;
		tracing::debug!(records = journal.records, "Compacted storage journal");
		journal.len = 0;
		journal.records = 0;
		Ok(())
	}
}

#[async_trait]
impl CommitSink for JournalSink {
	async fn persist(&self, changes: &[Change], tables: &Tables) -> Result<(), StorageError> {
		let mut entries = Vec::with_capacity(changes.len());
		for change in changes {
			entries.push(JournalEntry {
				table: change.table.as_str().to_string(),
				key: change.key.clone(),
				row: change.row.as_ref().map(PersistedRow::from_row).transpose()?,
			});
		}
		let mut line = serde_json::to_vec(&entries).map_err(serialization)?;
		line.push(b'\n');

		let mut journal = self.journal.lock().await;
		if journal.poisoned {
			return Err(StorageError::Backend(
				"storage journal is unusable after a failed write, reopen the storage".into(),
			));
		}
		if let Err(e) = journal.append(&line).await {
			journal.discard_tail().await;
			return Err(e);
		}

		if journal.records >= self.compact_after {
			if let Err(e) = self.compact(&mut journal, tables).await {
				tracing::warn!(error = %e, "Journal compaction failed, retrying after the next commit");
			}
		}
		Ok(())
	}
}

/// File-based storage implementation.
pub struct FileStorage {
	engine: Engine,
	/// Held for the lifetime of the storage; the OS releases the lock on drop.
	_lock: File,
}

impl FileStorage {
	/// Opens (or creates) the storage directory at `base_path`.
	pub fn open(base_path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
		Self::open_with(base_path, clock, DEFAULT_COMPACT_AFTER)
	}

	/// Opens the storage, compacting the journal every `compact_after` records.
	pub fn open_with(
		base_path: impl Into<PathBuf>,
		clock: Arc<dyn Clock>,
		compact_after: usize,
	) -> Result<Self, StorageError> {
		let base_path = base_path.into();
		std::fs::create_dir_all(&base_path).map_err(backend)?;

		let lock = File::create(base_path.join(LOCK_FILE)).map_err(backend)?;
		lock.try_lock_exclusive().map_err(|e| {
			StorageError::Backend(format!(
				"storage directory {} is in use: {}",
				base_path.display(),
				e
			))
		})?;

		let recovered = recover(&base_path)?;
		let journal_file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(base_path.join(JOURNAL_FILE))
			.map_err(backend)?;
		journal_file.set_len(recovered.journal_len).map_err(backend)?;

		let sink = Arc::new(JournalSink {
			base_path: base_path.clone(),
			compact_after: compact_after.max(1),
			journal: Mutex::new(Journal {
				file: fs::File::from_std(journal_file),
				len: recovered.journal_len,
				records: recovered.records,
				poisoned: false,
			}),
		});
		tracing::info!(
			path = %base_path.display(),
			journal_records = recovered.records,
			"Opened file storage"
		);

		Ok(Self {
			engine: Engine::new(Tables::from_rows(recovered.rows), clock, Some(sink)),
			_lock: lock,
		})
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
		Ok(Box::new(self.engine.begin().await))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.engine.cleanup_expired().await
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("storage_path", FieldType::String).with_validator(|v| {
					match v.as_str() {
						Some("") => Err("storage_path cannot be empty".into()),
						_ => Ok(()),
					}
				}),
				Field::new(
					"compact_after",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for the snapshot and journal (default: "./data/storage")
/// - `compact_after`: Journal records written before the snapshot is rewritten (default: 1000)
pub fn create_storage(
	config: &toml::Value,
	clock: Arc<dyn Clock>,
) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	let compact_after = config
		.get("compact_after")
		.and_then(|v| v.as_integer())
		.and_then(|v| usize::try_from(v).ok())
		.unwrap_or(DEFAULT_COMPACT_AFTER);

	Ok(Box::new(FileStorage::open_with(storage_path, clock, compact_after)?))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
