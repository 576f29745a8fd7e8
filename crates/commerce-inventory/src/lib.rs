//! Stock reservation manager.
//!
//! Tracks physical stock per product and the time-bounded holds placed on it.
//! Every mutation runs under the product's exclusive lock, so the check that
//! enough stock is available and the creation of the hold happen as one step
//! and concurrent checkouts can never promise the same unit twice.
//!
//! Each mutating operation comes in two forms: a standalone one that runs in
//! its own transaction, and an `*_in` form that stages its writes into a
//! caller's [`Transaction`] so the order lifecycle can commit stock, order and
//! ledger changes together.

use chrono::{DateTime, Duration, Utc};
use commerce_storage::{LockDomain, StorageError, StorageService, Transaction};
use commerce_types::{
	truncate_id, Clock, Product, ReservationStatus, StockReservation, StorageKey,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during stock operations.
#[derive(Debug, Error)]
pub enum InventoryError {
	#[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
	InsufficientStock {
		product_id: String,
		requested: u32,
		available: u32,
	},
	#[error("Reservation {reservation_id} is already {status}")]
	AlreadyTerminal {
		reservation_id: String,
		status: ReservationStatus,
	},
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Quantity must be greater than zero")]
	InvalidQuantity,
	/// A concurrent writer created the same entity first.
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Storage error: {0}")]
	Storage(String),
}

impl InventoryError {
	/// Whether retrying the operation may succeed.
	pub fn is_conflict(&self) -> bool {
		matches!(self, InventoryError::Conflict(_))
	}
}

impl From<StorageError> for InventoryError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::AlreadyExists(key) => InventoryError::Conflict(key),
			other => InventoryError::Storage(other.to_string()),
		}
	}
}

/// Result of committing a reservation.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
	pub reservation: StockReservation,
	/// The reservation had been committed before; no stock moved.
	pub already_committed: bool,
	/// Product availability after the commit.
	pub available: u32,
}

/// Service owning products and stock reservations.
pub struct InventoryService {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl InventoryService {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	pub fn now(&self) -> DateTime<Utc> {
		self.clock.now()
	}

	/// Registers a product with its initial on-hand count.
	pub async fn create_product(
		&self,
		id: &str,
		name: &str,
		on_hand: u32,
	) -> Result<Product, InventoryError> {
		let product = Product::new(id, name, on_hand, self.now());
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Product, [id]).await;
		tx.insert(StorageKey::Products.as_str(), id, &product)?;
		tx.commit().await?;

		tracing::info!(product_id = %id, on_hand, "Product created");
		Ok(product)
	}

	pub async fn product(&self, id: &str) -> Result<Product, InventoryError> {
		self.storage
			.find(StorageKey::Products.as_str(), id)
			.await?
			.ok_or_else(|| InventoryError::NotFound(format!("product {}", id)))
	}

	pub async fn available_stock(&self, id: &str) -> Result<u32, InventoryError> {
		Ok(self.product(id).await?.available_stock())
	}

	pub async fn products(&self) -> Result<Vec<Product>, InventoryError> {
		Ok(self.storage.list(StorageKey::Products.as_str()).await?)
	}

	pub async fn reservation(&self, id: &str) -> Result<StockReservation, InventoryError> {
		self.storage
			.find(StorageKey::Reservations.as_str(), id)
			.await?
			.ok_or_else(|| InventoryError::NotFound(format!("reservation {}", id)))
	}

	/// All reservations placed for one order reference, oldest first.
	pub async fn reservations_for(
		&self,
		order_ref: &str,
	) -> Result<Vec<StockReservation>, InventoryError> {
		let mut reservations: Vec<StockReservation> = self
			.storage
			.list::<StockReservation>(StorageKey::Reservations.as_str())
			.await?
			.into_iter()
			.filter(|r| r.order_ref == order_ref)
			.collect();
		reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
		Ok(reservations)
	}

	/// Places a hold of `quantity` units for `hold`.
	pub async fn reserve(
		&self,
		product_id: &str,
		quantity: u32,
		hold: Duration,
		order_ref: &str,
	) -> Result<StockReservation, InventoryError> {
		let expires_at = self.now() + hold;
		let mut tx = self.storage.begin();
		let reservation = self
			.reserve_in(&mut tx, product_id, quantity, expires_at, order_ref)
			.await?;
		tx.commit().await?;
		Ok(reservation)
	}

	/// Stages a hold that lasts until `expires_at`.
	pub async fn reserve_in(
		&self,
		tx: &mut Transaction<'_>,
		product_id: &str,
		quantity: u32,
		expires_at: DateTime<Utc>,
		order_ref: &str,
	) -> Result<StockReservation, InventoryError> {
		if quantity == 0 {
			return Err(InventoryError::InvalidQuantity);
		}

		tx.lock(LockDomain::Product, [product_id]).await;
		let mut product = load_product(tx, product_id).await?;

		let available = product.available_stock();
		if available < quantity {
			tracing::debug!(
				product_id = %product_id,
				requested = quantity,
				available,
				"Reservation rejected"
			);
			return Err(InventoryError::InsufficientStock {
				product_id: product_id.to_string(),
				requested: quantity,
				available,
			});
		}

		let now = self.now();
		let reservation = StockReservation {
			id: uuid::Uuid::new_v4().to_string(),
			product_id: product_id.to_string(),
			quantity,
			order_ref: order_ref.to_string(),
			status: ReservationStatus::Active,
			expires_at,
			created_at: now,
			updated_at: now,
		};

		product.reserved_stock += quantity;
		product.updated_at = now;
		tx.put(StorageKey::Products.as_str(), product_id, &product)?;
		tx.insert(StorageKey::Reservations.as_str(), &reservation.id, &reservation)?;

		tracing::debug!(
			reservation_id = %truncate_id(&reservation.id),
			product_id = %product_id,
			quantity,
			"Stock reserved"
		);
		Ok(reservation)
	}

	/// Converts a hold into a sale, taking the units out of `on_hand`.
	pub async fn commit(&self, reservation_id: &str) -> Result<CommitOutcome, InventoryError> {
		let mut tx = self.storage.begin();
		let outcome = self.commit_in(&mut tx, reservation_id).await?;
		tx.commit().await?;
		Ok(outcome)
	}

	pub async fn commit_in(
		&self,
		tx: &mut Transaction<'_>,
		reservation_id: &str,
	) -> Result<CommitOutcome, InventoryError> {
		let (mut reservation, mut product) = lock_reservation(tx, reservation_id).await?;

		match reservation.status {
			ReservationStatus::Committed => {
				return Ok(CommitOutcome {
					available: product.available_stock(),
					reservation,
					already_committed: true,
				})
			},
			ReservationStatus::Active => {},
			status => {
				return Err(InventoryError::AlreadyTerminal {
					reservation_id: reservation_id.to_string(),
					status,
				})
			},
		}

		let now = self.now();
		product.on_hand_stock = product.on_hand_stock.saturating_sub(reservation.quantity);
		product.reserved_stock = product.reserved_stock.saturating_sub(reservation.quantity);
		product.updated_at = now;
		reservation.status = ReservationStatus::Committed;
		reservation.updated_at = now;

		tx.put(StorageKey::Products.as_str(), &product.id, &product)?;
		tx.put(StorageKey::Reservations.as_str(), &reservation.id, &reservation)?;

		tracing::debug!(
			reservation_id = %truncate_id(reservation_id),
			product_id = %product.id,
			on_hand = product.on_hand_stock,
			"Reservation committed"
		);
		Ok(CommitOutcome {
			available: product.available_stock(),
			reservation,
			already_committed: false,
		})
	}

	/// Gives a hold back without selling it.
	pub async fn release(&self, reservation_id: &str) -> Result<StockReservation, InventoryError> {
		let mut tx = self.storage.begin();
		let reservation = self.release_in(&mut tx, reservation_id).await?;
		tx.commit().await?;
		Ok(reservation)
	}

	pub async fn release_in(
		&self,
		tx: &mut Transaction<'_>,
		reservation_id: &str,
	) -> Result<StockReservation, InventoryError> {
		self.finish_in(tx, reservation_id, ReservationStatus::Released)
			.await
	}

	/// Forces an active hold to `expired` regardless of its expiry time.
	pub async fn expire(&self, reservation_id: &str) -> Result<StockReservation, InventoryError> {
		let mut tx = self.storage.begin();
		let reservation = self.expire_in(&mut tx, reservation_id).await?;
		tx.commit().await?;
		Ok(reservation)
	}

	pub async fn expire_in(
		&self,
		tx: &mut Transaction<'_>,
		reservation_id: &str,
	) -> Result<StockReservation, InventoryError> {
		self.finish_in(tx, reservation_id, ReservationStatus::Expired)
			.await
	}

	async fn finish_in(
		&self,
		tx: &mut Transaction<'_>,
		reservation_id: &str,
		target: ReservationStatus,
	) -> Result<StockReservation, InventoryError> {
		let (mut reservation, mut product) = lock_reservation(tx, reservation_id).await?;
		if reservation.status.is_terminal() {
			return Err(InventoryError::AlreadyTerminal {
				reservation_id: reservation_id.to_string(),
				status: reservation.status,
			});
		}

		let now = self.now();
		product.reserved_stock = product.reserved_stock.saturating_sub(reservation.quantity);
		product.updated_at = now;
		reservation.status = target;
		reservation.updated_at = now;

		tx.put(StorageKey::Products.as_str(), &product.id, &product)?;
		tx.put(StorageKey::Reservations.as_str(), &reservation.id, &reservation)?;

		tracing::debug!(
			reservation_id = %truncate_id(reservation_id),
			status = %target,
			"Reservation closed"
		);
		Ok(reservation)
	}

	/// Expires every active reservation whose expiry lies before `now`.
	///
	/// Each reservation is handled in its own transaction; a reservation
	/// committed concurrently keeps its committed state. Returns how many
	/// reservations were expired.
	pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, InventoryError> {
		let candidates: Vec<StockReservation> = self
			.storage
			.list::<StockReservation>(StorageKey::Reservations.as_str())
			.await?
			.into_iter()
			.filter(|r| r.is_overdue(now))
			.collect();

		let mut expired = 0;
		for candidate in candidates {
			match self.expire_if_overdue(&candidate.id, now).await {
				Ok(true) => expired += 1,
				Ok(false) => {},
				Err(e) => {
					tracing::warn!(
						reservation_id = %truncate_id(&candidate.id),
						error = %e,
						"Failed to expire reservation"
					);
				},
			}
		}

		if expired > 0 {
			tracing::info!(expired, "Expired overdue reservations");
		}
		Ok(expired)
	}

	async fn expire_if_overdue(
		&self,
		reservation_id: &str,
		now: DateTime<Utc>,
	) -> Result<bool, InventoryError> {
		let mut tx = self.storage.begin();
		let (reservation, _) = lock_reservation(&mut tx, reservation_id).await?;
		if !reservation.is_overdue(now) {
			return Ok(false);
		}
		self.expire_in(&mut tx, reservation_id).await?;
		tx.commit().await?;
		Ok(true)
	}

	/// Pushes an active hold's expiry out. Never shortens a hold.
	pub async fn extend(
		&self,
		reservation_id: &str,
		new_expires_at: DateTime<Utc>,
	) -> Result<StockReservation, InventoryError> {
		let mut tx = self.storage.begin();
		let (mut reservation, _) = lock_reservation(&mut tx, reservation_id).await?;
		if reservation.status.is_terminal() {
			return Err(InventoryError::AlreadyTerminal {
				reservation_id: reservation_id.to_string(),
				status: reservation.status,
			});
		}
		if new_expires_at <= reservation.expires_at {
			return Ok(reservation);
		}

		reservation.expires_at = new_expires_at;
		reservation.updated_at = self.now();
		tx.put(StorageKey::Reservations.as_str(), &reservation.id, &reservation)?;
		tx.commit().await?;
		Ok(reservation)
	}

	/// Puts the units of a committed reservation back on hand, for a paid
	/// order cancelled before shipment. The reservation stays committed.
	pub async fn restock_in(
		&self,
		tx: &mut Transaction<'_>,
		reservation_id: &str,
	) -> Result<Product, InventoryError> {
		let (reservation, mut product) = lock_reservation(tx, reservation_id).await?;
		if reservation.status != ReservationStatus::Committed {
			return Err(InventoryError::AlreadyTerminal {
				reservation_id: reservation_id.to_string(),
				status: reservation.status,
			});
		}

		product.on_hand_stock = product.on_hand_stock.saturating_add(reservation.quantity);
		product.updated_at = self.now();
		tx.put(StorageKey::Products.as_str(), &product.id, &product)?;

		tracing::debug!(
			reservation_id = %truncate_id(reservation_id),
			product_id = %product.id,
			quantity = reservation.quantity,
			"Committed stock returned"
		);
		Ok(product)
	}

	/// Books an arrival of goods (purchase order received, manual restock).
	pub async fn receive_stock(&self, product_id: &str, quantity: u32) -> Result<Product, InventoryError> {
		if quantity == 0 {
			return Err(InventoryError::InvalidQuantity);
		}

		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Product, [product_id]).await;
		let mut product = load_product(&tx, product_id).await?;
		product.on_hand_stock = product.on_hand_stock.saturating_add(quantity);
		product.updated_at = self.now();
		tx.put(StorageKey::Products.as_str(), product_id, &product)?;
		tx.commit().await?;

		tracing::info!(product_id = %product_id, quantity, on_hand = product.on_hand_stock, "Stock received");
		Ok(product)
	}

	/// Recomputes each product's reserved counter from its active
	/// reservations and repairs any drift. Returns the number of products
	/// repaired.
	pub async fn reconcile(&self) -> Result<usize, InventoryError> {
		let products = self.products().await?;
		let mut repaired = 0;

		for product in products {
			let mut tx = self.storage.begin();
			tx.lock(LockDomain::Product, [product.id.as_str()]).await;

			let Some(mut current) = tx
				.find::<Product>(StorageKey::Products.as_str(), &product.id)
				.await?
			else {
				continue;
			};
			let held = self.active_quantities().await?;
			let expected = held.get(&current.id).copied().unwrap_or(0);

			if current.reserved_stock != expected {
				tracing::warn!(
					product_id = %current.id,
					cached = current.reserved_stock,
					actual = expected,
					"Repairing reserved stock counter"
				);
				current.reserved_stock = expected;
				current.updated_at = self.now();
				tx.put(StorageKey::Products.as_str(), &current.id, &current)?;
				tx.commit().await?;
				repaired += 1;
			}
		}

		Ok(repaired)
	}

	async fn active_quantities(&self) -> Result<HashMap<String, u32>, InventoryError> {
		let mut held: HashMap<String, u32> = HashMap::new();
		for reservation in self
			.storage
			.list::<StockReservation>(StorageKey::Reservations.as_str())
			.await?
		{
			if reservation.status == ReservationStatus::Active {
				*held.entry(reservation.product_id).or_default() += reservation.quantity;
			}
		}
		Ok(held)
	}
}

async fn load_product(tx: &Transaction<'_>, product_id: &str) -> Result<Product, InventoryError> {
	tx.find(StorageKey::Products.as_str(), product_id)
		.await?
		.ok_or_else(|| InventoryError::NotFound(format!("product {}", product_id)))
}

async fn load_reservation(
	tx: &Transaction<'_>,
	reservation_id: &str,
) -> Result<StockReservation, InventoryError> {
	tx.find(StorageKey::Reservations.as_str(), reservation_id)
		.await?
		.ok_or_else(|| InventoryError::NotFound(format!("reservation {}", reservation_id)))
}

/// Takes the lock of a reservation's product and returns both, read under
/// the lock.
async fn lock_reservation(
	tx: &mut Transaction<'_>,
	reservation_id: &str,
) -> Result<(StockReservation, Product), InventoryError> {
	let unlocked = load_reservation(tx, reservation_id).await?;
	tx.lock(LockDomain::Product, [unlocked.product_id.as_str()])
		.await;
	let reservation = load_reservation(tx, reservation_id).await?;
	let product = load_product(tx, &reservation.product_id).await?;
	Ok((reservation, product))
}
