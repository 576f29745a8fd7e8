//! Unit of work over [`StorageService`].
//!
//! A transaction collects entity locks and staged writes. Reads see the
//! transaction's own staged writes first. `commit` hands every staged write to
//! the backend as a single atomic batch; dropping an uncommitted transaction
//! discards the staged writes and releases the locks, which is the rollback.

use crate::{decode, encode, storage_key, BatchOp, LockDomain, LockKey, StorageError, StorageService};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone)]
enum Staged {
	Put(Vec<u8>),
	Insert(Vec<u8>),
	Delete,
}

pub struct Transaction<'a> {
	storage: &'a StorageService,
	staged: HashMap<String, Staged>,
	order: Vec<String>,
	held: HashSet<LockKey>,
	guards: Vec<OwnedMutexGuard<()>>,
}

impl<'a> Transaction<'a> {
	pub(crate) fn new(storage: &'a StorageService) -> Self {
		Self {
			storage,
			staged: HashMap::new(),
			order: Vec::new(),
			held: HashSet::new(),
			guards: Vec::new(),
		}
	}

	/// Takes the locks for `ids` in `domain`, in ascending id order.
	///
	/// Locks the transaction already holds are skipped. Callers lock domains
	/// in [`LockDomain`] order: orders first, then products, then accounts.
	/// Every id needed in a domain goes into one call; a second call must not
	/// add an id that sorts below one already held there.
	pub async fn lock<I, S>(&mut self, domain: LockDomain, ids: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let keys: Vec<LockKey> = ids
			.into_iter()
			.map(|id| LockKey::new(domain, id))
			.filter(|key| !self.held.contains(key))
			.collect();

		for (key, guard) in self.storage.locks().acquire_all(keys).await {
			self.held.insert(key);
			self.guards.push(guard);
		}
	}

	/// Whether this transaction holds the lock of the given entity.
	pub fn holds(&self, domain: LockDomain, id: &str) -> bool {
		self.held.contains(&LockKey::new(domain, id))
	}

	/// Reads an entity, preferring this transaction's staged version.
	pub async fn get<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Result<T, StorageError> {
		let key = storage_key(namespace, id);
		match self.staged.get(&key) {
			Some(Staged::Put(bytes)) | Some(Staged::Insert(bytes)) => decode(bytes),
			Some(Staged::Delete) => Err(StorageError::NotFound),
			None => decode(&self.storage.backend().get_bytes(&key).await?),
		}
	}

	/// Like `get`, mapping a missing entity to `None`.
	pub async fn find<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.get(namespace, id).await {
			Ok(value) => Ok(Some(value)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Stages a create-or-overwrite.
	pub fn put<T: Serialize>(&mut self, namespace: &str, id: &str, value: &T) -> Result<(), StorageError> {
		let key = storage_key(namespace, id);
		let bytes = encode(value)?;
		let staged = match self.staged.get(&key) {
			// An entity created in this transaction stays a create.
			Some(Staged::Insert(_)) => Staged::Insert(bytes),
			_ => Staged::Put(bytes),
		};
		self.stage(key, staged);
		Ok(())
	}

	/// Stages a create. Commit fails with `AlreadyExists` if the entity was
	/// written in the meantime.
	pub fn insert<T: Serialize>(
		&mut self,
		namespace: &str,
		id: &str,
		value: &T,
	) -> Result<(), StorageError> {
		let key = storage_key(namespace, id);
		if matches!(self.staged.get(&key), Some(Staged::Put(_)) | Some(Staged::Insert(_))) {
			return Err(StorageError::AlreadyExists(key));
		}
		let bytes = encode(value)?;
		self.stage(key, Staged::Insert(bytes));
		Ok(())
	}

	pub fn delete(&mut self, namespace: &str, id: &str) {
		self.stage(storage_key(namespace, id), Staged::Delete);
	}

	fn stage(&mut self, key: String, op: Staged) {
		if self.staged.insert(key.clone(), op).is_none() {
			self.order.push(key);
		}
	}

	/// Number of staged writes.
	pub fn len(&self) -> usize {
		self.staged.len()
	}

	pub fn is_empty(&self) -> bool {
		self.staged.is_empty()
	}

	/// Writes every staged change in one atomic batch, then releases the locks.
	pub async fn commit(mut self) -> Result<(), StorageError> {
		if self.staged.is_empty() {
			return Ok(());
		}

		let mut ops = Vec::with_capacity(self.order.len());
		for key in std::mem::take(&mut self.order) {
			let op = match self.staged.remove(&key) {
				Some(Staged::Put(value)) => BatchOp::Put { key, value },
				Some(Staged::Insert(value)) => BatchOp::Insert { key, value },
				Some(Staged::Delete) => BatchOp::Delete { key },
				None => continue,
			};
			ops.push(op);
		}

		tracing::trace!(writes = ops.len(), locks = self.guards.len(), "Committing transaction");
		self.storage.backend().apply_batch(ops).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use std::sync::Arc;
	use std::time::Duration;

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_read_your_writes() {
		let storage = service();
		storage.store("counters", "a", &1u32).await.unwrap();

		let mut tx = storage.begin();
		tx.put("counters", "a", &2u32).unwrap();
		assert_eq!(tx.get::<u32>("counters", "a").await.unwrap(), 2);
		assert_eq!(storage.retrieve::<u32>("counters", "a").await.unwrap(), 1);

		tx.delete("counters", "a");
		assert!(tx.find::<u32>("counters", "a").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_drop_is_rollback() {
		let storage = service();
		{
			let mut tx = storage.begin();
			tx.lock(LockDomain::Product, ["sku"]).await;
			tx.put("counters", "a", &5u32).unwrap();
		}
		assert!(!storage.exists("counters", "a").await.unwrap());
		// Lock must be free again.
		let _g = storage
			.locks()
			.acquire(&LockKey::new(LockDomain::Product, "sku"))
			.await;
	}

	#[tokio::test]
	async fn test_commit_applies_all_writes() {
		let storage = service();
		storage.store("counters", "gone", &0u32).await.unwrap();

		let mut tx = storage.begin();
		tx.insert("counters", "new", &1u32).unwrap();
		tx.put("counters", "other", &2u32).unwrap();
		tx.delete("counters", "gone");
		tx.commit().await.unwrap();

		assert_eq!(storage.retrieve::<u32>("counters", "new").await.unwrap(), 1);
		assert_eq!(storage.retrieve::<u32>("counters", "other").await.unwrap(), 2);
		assert!(!storage.exists("counters", "gone").await.unwrap());
	}

	#[tokio::test]
	async fn test_insert_conflict_rejects_whole_batch() {
		let storage = service();
		storage.store("counters", "taken", &0u32).await.unwrap();

		let mut tx = storage.begin();
		tx.put("counters", "side", &9u32).unwrap();
		tx.insert("counters", "taken", &1u32).unwrap();
		let result = tx.commit().await;

		assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
		assert!(!storage.exists("counters", "side").await.unwrap());
		assert_eq!(storage.retrieve::<u32>("counters", "taken").await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_relock_is_noop() {
		let storage = service();
		let mut tx = storage.begin();
		tx.lock(LockDomain::Order, ["o-1"]).await;
		// Would deadlock if the held lock were taken again.
		tx.lock(LockDomain::Order, ["o-1", "o-2"]).await;
		assert!(tx.holds(LockDomain::Order, "o-1"));
		assert!(tx.holds(LockDomain::Order, "o-2"));
	}

	#[tokio::test]
	async fn test_locks_serialize_transactions() {
		let storage = Arc::new(service());
		storage.store("counters", "c", &0u32).await.unwrap();

		let mut handles = Vec::new();
		for _ in 0..16 {
			let storage = storage.clone();
			handles.push(tokio::spawn(async move {
				let mut tx = storage.begin();
				tx.lock(LockDomain::Product, ["c"]).await;
				let n: u32 = tx.get("counters", "c").await.unwrap();
				tokio::time::sleep(Duration::from_millis(1)).await;
				tx.put("counters", "c", &(n + 1)).unwrap();
				tx.commit().await.unwrap();
			}));
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(storage.retrieve::<u32>("counters", "c").await.unwrap(), 16);
	}
}
