//! File-based storage backend.
//!
//! Entities live at `<storage_path>/<namespace>/<id>.bin`, each file prefixed
//! with a fixed header carrying an optional expiry. Single writes go through a
//! temp file and a rename. Batches are first written to a write-ahead log,
//! then applied file by file, then the log is removed. A batch that fails
//! while applying puts back the files it replaced before returning; a log
//! found at startup belongs to a batch that was interrupted and is applied
//! again.
//!
//! Every namespace holds durable records, so expiry is only set by callers
//! that pass an explicit TTL to `set_bytes`.

use crate::{
	split_key, BatchOp, StorageError, StorageFactory, StorageInterface, StorageRegistry,
};
use async_trait::async_trait;
use commerce_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const WAL_FILE: &str = "batch.wal";
const LOCK_FILE: &str = ".lock";

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

fn backend_err(e: impl std::fmt::Display) -> StorageError {
	StorageError::Backend(e.to_string())
}

#[allow(clippy::doc_nested_refdefs)]
/// Fixed-size file header for TTL support.
///
/// Binary layout (64 bytes total):
/// - [0-3]: Magic bytes "CMRC"
/// - [4-5]: Version (u16, little-endian)
/// - [6-13]: Expiration timestamp (u64, little-endian, Unix seconds, 0 = never)
/// - [14-63]: Reserved
#[derive(Debug, Clone)]
struct FileHeader {
	version: u16,
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"CMRC";
	const VERSION: u16 = 1;
	const SIZE: usize = 64;

	fn new(ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0
		} else {
			unix_now().saturating_add(ttl.as_secs())
		};
		Self {
			version: Self::VERSION,
			expires_at,
		}
	}

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Unknown file format".into()));
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut expires_bytes = [0u8; 8];
		expires_bytes.copy_from_slice(&bytes[6..14]);
		Ok(Self {
			version,
			expires_at: u64::from_le_bytes(expires_bytes),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at != 0 && unix_now() >= self.expires_at
	}
}

/// One file-level step of a logged batch, relative to the storage root.
#[derive(Debug, Serialize, Deserialize)]
struct WalRecord {
	path: PathBuf,
	contents: Option<Vec<u8>>,
}

/// File-based storage implementation.
///
/// The storage directory is locked exclusively for the lifetime of the value,
/// so two processes cannot write the same data set.
pub struct FileStorage {
	base_path: PathBuf,
	/// Serializes writers; readers rely on rename being atomic.
	write_lock: Mutex<()>,
	_dir_lock: std::fs::File,
}

impl FileStorage {
	/// Opens (creating if needed) a storage directory and replays any
	/// interrupted batch.
	pub fn open(base_path: PathBuf) -> Result<Self, StorageError> {
		std::fs::create_dir_all(&base_path).map_err(backend_err)?;

		let dir_lock = std::fs::OpenOptions::new()
			.create(true)
			.write(true)
			.truncate(false)
			.open(base_path.join(LOCK_FILE))
			.map_err(backend_err)?;
		dir_lock.try_lock_exclusive().map_err(|e| {
			StorageError::Backend(format!(
				"Storage directory {} is in use: {}",
				base_path.display(),
				e
			))
		})?;

		let storage = Self {
			base_path,
			write_lock: Mutex::new(()),
			_dir_lock: dir_lock,
		};
		storage.replay_wal()?;
		Ok(storage)
	}

	fn wal_path(&self) -> PathBuf {
		self.base_path.join(WAL_FILE)
	}

	fn replay_wal(&self) -> Result<(), StorageError> {
		let wal_path = self.wal_path();
		let raw = match std::fs::read(&wal_path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(backend_err(e)),
		};

		// A log that does not parse was cut short before the batch started
		// applying, so nothing of it is visible yet.
		match serde_json::from_slice::<Vec<WalRecord>>(&raw) {
			Ok(records) => {
				tracing::warn!(records = records.len(), "Replaying interrupted storage batch");
				for record in records {
					let path = self.base_path.join(&record.path);
					match record.contents {
						Some(contents) => {
							if let Some(parent) = path.parent() {
								std::fs::create_dir_all(parent).map_err(backend_err)?;
							}
							let temp_path = path.with_extension("tmp");
							std::fs::write(&temp_path, contents).map_err(backend_err)?;
							std::fs::rename(&temp_path, &path).map_err(backend_err)?;
						},
						None => match std::fs::remove_file(&path) {
							Ok(()) => {},
							Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
							Err(e) => return Err(backend_err(e)),
						},
					}
				}
			},
			Err(e) => {
				tracing::warn!(error = %e, "Discarding incomplete storage batch log");
			},
		}

		std::fs::remove_file(&wal_path).map_err(backend_err)
	}

	/// Path of a key relative to the storage root.
	fn relative_path(key: &str) -> PathBuf {
		let (namespace, id) = split_key(key);
		let namespace = if namespace.is_empty() { "_" } else { namespace };
		PathBuf::from(encode_segment(namespace)).join(format!("{}.bin", encode_segment(id)))
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		self.base_path.join(Self::relative_path(key))
	}

	fn frame(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
		let header = FileHeader::new(ttl.unwrap_or(Duration::ZERO)).serialize();
		let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
		file_data.extend_from_slice(&header);
		file_data.extend_from_slice(value);
		file_data
	}

	/// Reads a file's payload, treating expired entries as absent.
	async fn read_live(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
		let data = match fs::read(path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(backend_err(e)),
		};

		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			return Ok(None);
		}
		Ok(Some(data[FileHeader::SIZE..].to_vec()))
	}

	async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await.map_err(backend_err)?;
		}
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, contents).await.map_err(backend_err)?;
		fs::rename(&temp_path, path).await.map_err(backend_err)
	}

	async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
		match fs::remove_file(path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(backend_err(e)),
		}
	}

	/// Whole file contents, header included, or `None` when absent.
	async fn read_raw(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
		match fs::read(path).await {
			Ok(data) => Ok(Some(data)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(backend_err(e)),
		}
	}

	/// Puts back the files a failed batch touched, newest first, then drops
	/// the batch's log. If restoring fails the log stays and the batch is
	/// applied in full on the next open.
	async fn restore(
		&self,
		records: &[WalRecord],
		previous: &[Option<Vec<u8>>],
	) -> Result<(), StorageError> {
		for (record, contents) in records.iter().zip(previous).rev() {
			let path = self.base_path.join(&record.path);
			match contents {
				Some(contents) => Self::write_atomic(&path, contents).await?,
				None => Self::remove_if_present(&path).await?,
			}
		}
		fs::remove_file(self.wal_path()).await.map_err(backend_err)
	}

	async fn write_wal(&self, records: &[WalRecord]) -> Result<(), StorageError> {
		let raw = serde_json::to_vec(records).map_err(|e| StorageError::Serialization(e.to_string()))?;
		let mut file = fs::File::create(self.wal_path()).await.map_err(backend_err)?;
		file.write_all(&raw).await.map_err(backend_err)?;
		file.sync_all().await.map_err(backend_err)
	}

	async fn cleanup_expired_files(&self) -> Result<usize, StorageError> {
		let _guard = self.write_lock.lock().await;
		let mut removed = 0;
		let mut namespaces = fs::read_dir(&self.base_path).await.map_err(backend_err)?;

		while let Some(namespace) = namespaces.next_entry().await.map_err(backend_err)? {
			if !namespace.path().is_dir() {
				continue;
			}
			let mut entries = fs::read_dir(namespace.path()).await.map_err(backend_err)?;
			while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
				let path = entry.path();
				if path.extension() != Some(std::ffi::OsStr::new("bin")) {
					continue;
				}
				let data = match fs::read(&path).await {
					Ok(data) => data,
					Err(e) => {
						tracing::debug!("Skipping file {:?}: could not be read: {}", path, e);
						continue;
					},
				};
				match FileHeader::deserialize(&data) {
					Ok(header) if header.is_expired() => {
						if let Err(e) = fs::remove_file(&path).await {
							tracing::warn!("Failed to remove expired file {:?}: {}", path, e);
						} else {
							removed += 1;
						}
					},
					Ok(_) => {},
					Err(e) => tracing::debug!("Skipping file {:?}: {}", path, e),
				}
			}
		}
		Ok(removed)
	}
}

fn encode_segment(segment: &str) -> String {
	let mut out = String::with_capacity(segment.len());
	for c in segment.chars() {
		match c {
			'%' => out.push_str("%25"),
			'/' => out.push_str("%2F"),
			'\\' => out.push_str("%5C"),
			':' => out.push_str("%3A"),
			_ => out.push(c),
		}
	}
	out
}

fn decode_segment(segment: &str) -> String {
	let mut out = String::with_capacity(segment.len());
	let mut rest = segment;
	while let Some(pos) = rest.find('%') {
		out.push_str(&rest[..pos]);
		let decoded = match rest.get(pos + 1..pos + 3) {
			Some("25") => Some('%'),
			Some("2F") => Some('/'),
			Some("5C") => Some('\\'),
			Some("3A") => Some(':'),
			_ => None,
		};
		match decoded {
			Some(c) => {
				out.push(c);
				rest = &rest[pos + 3..];
			},
			None => {
				out.push('%');
				rest = &rest[pos + 1..];
			},
		}
	}
	out.push_str(rest);
	out
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		Self::read_live(&self.get_file_path(key))
			.await?
			.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let contents = Self::frame(&value, ttl);
		let _guard = self.write_lock.lock().await;
		Self::write_atomic(&self.get_file_path(key), &contents).await
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		Self::remove_if_present(&self.get_file_path(key)).await
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(Self::read_live(&self.get_file_path(key)).await?.is_some())
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let dir = self.base_path.join(encode_segment(namespace));
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(backend_err(e)),
		};

		let mut ids = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}
			if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
				ids.push(decode_segment(stem));
			}
		}
		Ok(ids)
	}

	async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
		if ops.is_empty() {
			return Ok(());
		}
		let _guard = self.write_lock.lock().await;

		for op in &ops {
			if let BatchOp::Insert { key, .. } = op {
				if Self::read_live(&self.get_file_path(key)).await?.is_some() {
					return Err(StorageError::AlreadyExists(key.clone()));
				}
			}
		}

		let records: Vec<WalRecord> = ops
			.iter()
			.map(|op| WalRecord {
				path: Self::relative_path(op.key()),
				contents: match op {
					BatchOp::Put { key, value } | BatchOp::Insert { key, value } => {
						Some(Self::frame(value, None))
					},
					BatchOp::Delete { .. } => None,
				},
			})
			.collect();

		let mut previous = Vec::with_capacity(records.len());
		for record in &records {
			previous.push(Self::read_raw(&self.base_path.join(&record.path)).await?);
		}

		self.write_wal(&records).await?;

		for (applied, record) in records.iter().enumerate() {
			let path = self.base_path.join(&record.path);
			let result = match &record.contents {
				Some(contents) => Self::write_atomic(&path, contents).await,
				None => Self::remove_if_present(&path).await,
			};
			if let Err(e) = result {
				tracing::error!(error = %e, applied, records = records.len(), "Storage batch failed, restoring");
				self.restore(&records[..=applied], &previous[..=applied]).await?;
				return Err(e);
			}
		}

		fs::remove_file(self.wal_path()).await.map_err(backend_err)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.cleanup_expired_files().await
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		if let Some(table) = config.as_table() {
			if let Some(key) = table.keys().find(|key| key.starts_with("ttl_")) {
				return Err(ValidationError::InvalidValue {
					field: key.clone(),
					message: "records in every namespace are durable and cannot expire".into(),
				});
			}
		}

		Schema::new(vec![], vec![Field::new("storage_path", FieldType::String)]).validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	Ok(Box::new(FileStorage::open(PathBuf::from(storage_path))?))
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

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn open(dir: &TempDir) -> FileStorage {
		FileStorage::open(dir.path().to_path_buf()).unwrap()
	}

	#[tokio::test]
	async fn test_round_trip_and_namespace_layout() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);

		storage
			.set_bytes("products:sku/red:xl", b"payload".to_vec(), None)
			.await
			.unwrap();

		assert!(dir.path().join("products").is_dir());
		assert_eq!(
			storage.get_bytes("products:sku/red:xl").await.unwrap(),
			b"payload".to_vec()
		);
		assert_eq!(
			storage.list_ids("products").await.unwrap(),
			vec!["sku/red:xl".to_string()]
		);
		assert!(storage.list_ids("orders").await.unwrap().is_empty());

		storage.delete("products:sku/red:xl").await.unwrap();
		assert!(!storage.exists("products:sku/red:xl").await.unwrap());
	}

	#[tokio::test]
	async fn test_expired_entries_are_invisible_and_cleaned() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);

		let header = FileHeader {
			version: FileHeader::VERSION,
			expires_at: 1,
		};
		let mut contents = header.serialize().to_vec();
		contents.extend_from_slice(b"stale");
		std::fs::create_dir_all(dir.path().join("reservations")).unwrap();
		std::fs::write(dir.path().join("reservations").join("r-1.bin"), contents).unwrap();

		assert!(matches!(
			storage.get_bytes("reservations:r-1").await,
			Err(StorageError::NotFound)
		));
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
		assert!(!dir.path().join("reservations").join("r-1.bin").exists());
	}

	#[tokio::test]
	async fn test_batch_conflict_writes_nothing() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);
		storage.set_bytes("orders:o-1", vec![1], None).await.unwrap();

		let result = storage
			.apply_batch(vec![
				BatchOp::Put {
					key: "invoices:i-1".into(),
					value: vec![2],
				},
				BatchOp::Insert {
					key: "orders:o-1".into(),
					value: vec![3],
				},
			])
			.await;

		assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
		assert!(!storage.exists("invoices:i-1").await.unwrap());
		assert!(!dir.path().join(WAL_FILE).exists());
	}

	#[tokio::test]
	async fn test_batch_applies_and_clears_log() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);
		storage.set_bytes("orders:old", vec![0], None).await.unwrap();

		storage
			.apply_batch(vec![
				BatchOp::Insert {
					key: "orders:new".into(),
					value: vec![1],
				},
				BatchOp::Delete {
					key: "orders:old".into(),
				},
			])
			.await
			.unwrap();

		assert_eq!(storage.get_bytes("orders:new").await.unwrap(), vec![1]);
		assert!(!storage.exists("orders:old").await.unwrap());
		assert!(!dir.path().join(WAL_FILE).exists());
	}

	#[tokio::test]
	async fn test_interrupted_batch_is_replayed_on_open() {
		let dir = TempDir::new().unwrap();
		{
			let storage = open(&dir);
			storage.set_bytes("orders:old", vec![0], None).await.unwrap();
		}

		let mut contents = FileHeader::new(Duration::ZERO).serialize().to_vec();
		contents.push(7);
		let records = vec![
			WalRecord {
				path: FileStorage::relative_path("orders:o-9"),
				contents: Some(contents),
			},
			WalRecord {
				path: FileStorage::relative_path("orders:old"),
				contents: None,
			},
		];
		std::fs::write(dir.path().join(WAL_FILE), serde_json::to_vec(&records).unwrap()).unwrap();

		let storage = open(&dir);
		assert_eq!(storage.get_bytes("orders:o-9").await.unwrap(), vec![7]);
		assert!(!storage.exists("orders:old").await.unwrap());
		assert!(!dir.path().join(WAL_FILE).exists());
	}

	#[tokio::test]
	async fn test_truncated_log_is_discarded() {
		let dir = TempDir::new().unwrap();
		std::fs::write(dir.path().join(WAL_FILE), b"[{\"path\":").unwrap();

		let storage = open(&dir);
		assert!(storage.list_ids("orders").await.unwrap().is_empty());
		assert!(!dir.path().join(WAL_FILE).exists());
	}

	#[test]
	fn test_directory_lock_is_exclusive() {
		let dir = TempDir::new().unwrap();
		let _first = open(&dir);
		let second = FileStorage::open(dir.path().to_path_buf());
		assert!(matches!(second, Err(StorageError::Backend(_))));
	}

	#[test]
	fn test_segment_encoding() {
		for raw in ["plain", "a/b", "x:y", "100%", "%2F", "c:\\d"] {
			assert_eq!(decode_segment(&encode_segment(raw)), raw);
		}
	}

	#[test]
	fn test_schema_rejects_namespace_ttl() {
		for key in ["ttl_journal_entries", "ttl_accounts", "ttl_reservations", "ttl_orders"] {
			let table: toml::Table = toml::from_str(&format!("storage_path = \"/tmp/x\"\n{} = 60", key)).unwrap();
			let config = toml::Value::Table(table);
			let err = FileStorageSchema.validate(&config).unwrap_err();
			assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == key));
		}

		let table: toml::Table = toml::from_str("storage_path = \"/tmp/x\"").unwrap();
		let config = toml::Value::Table(table);
		assert!(FileStorageSchema.validate(&config).is_ok());
	}

	#[tokio::test]
	async fn test_create_storage_refuses_ledger_expiry() {
		let dir = TempDir::new().unwrap();
		let table: toml::Table = toml::from_str(&format!(
			"storage_path = \"{}\"\nttl_journal_entries = 1\nttl_accounts = 1",
			dir.path().display()
		))
		.unwrap();
		let config = toml::Value::Table(table);
		assert!(matches!(
			create_storage(&config),
			Err(StorageError::Configuration(_))
		));
	}

	#[tokio::test]
	async fn test_failed_batch_leaves_nothing_behind() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);
		storage.set_bytes("orders:a", vec![1], None).await.unwrap();

		// A directory where the last write stages its temp file makes that
		// write fail after the earlier ones landed.
		std::fs::create_dir_all(dir.path().join("orders").join("b.tmp")).unwrap();

		let result = storage
			.apply_batch(vec![
				BatchOp::Put {
					key: "orders:a".into(),
					value: vec![2],
				},
				BatchOp::Insert {
					key: "orders:c".into(),
					value: vec![3],
				},
				BatchOp::Put {
					key: "orders:b".into(),
					value: vec![4],
				},
			])
			.await;

		assert!(matches!(result, Err(StorageError::Backend(_))));
		assert_eq!(storage.get_bytes("orders:a").await.unwrap(), vec![1]);
		assert!(!storage.exists("orders:c").await.unwrap());
		assert!(!storage.exists("orders:b").await.unwrap());
		assert!(!dir.path().join(WAL_FILE).exists());
	}
}
