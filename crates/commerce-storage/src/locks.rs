//! Per-entity mutual exclusion.
//!
//! Every mutation of a product, order or account runs while holding that
//! entity's lock. Locks are always taken in [`LockDomain`] order and, within a
//! domain, in ascending id order, so two operations touching overlapping sets
//! of entities cannot deadlock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Kind of entity a lock protects. The derive order is the acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockDomain {
	Order,
	Product,
	Account,
}

/// Identifies one lockable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
	pub domain: LockDomain,
	pub id: String,
}

impl LockKey {
	pub fn new(domain: LockDomain, id: impl Into<String>) -> Self {
		Self {
			domain,
			id: id.into(),
		}
	}
}

/// Table of lazily created async mutexes, one per entity.
#[derive(Default)]
pub struct LockManager {
	locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockManager {
	fn handle(&self, key: &LockKey) -> Arc<Mutex<()>> {
		self.locks
			.entry(key.clone())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}

	/// Waits for and takes the lock of a single entity.
	pub async fn acquire(&self, key: &LockKey) -> OwnedMutexGuard<()> {
		self.handle(key).lock_owned().await
	}

	/// Takes the locks of several entities in hierarchy order.
	///
	/// Duplicate keys are collapsed. The returned guards are sorted the same
	/// way they were acquired.
	pub async fn acquire_all(
		&self,
		keys: impl IntoIterator<Item = LockKey>,
	) -> Vec<(LockKey, OwnedMutexGuard<()>)> {
		let mut keys: Vec<LockKey> = keys.into_iter().collect();
		keys.sort();
		keys.dedup();

		let mut guards = Vec::with_capacity(keys.len());
		for key in keys {
			let guard = self.acquire(&key).await;
			guards.push((key, guard));
		}
		guards
	}

	/// Drops table entries nobody holds or waits on.
	///
	/// Returns the number of entries removed.
	pub fn purge_idle(&self) -> usize {
		let before = self.locks.len();
		self.locks
			.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
		before.saturating_sub(self.locks.len())
	}

	pub fn len(&self) -> usize {
		self.locks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.locks.is_empty()
	}
}
