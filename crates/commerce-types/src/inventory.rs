//! Stock types: products and the reservations held against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stock-keeping product with its physical and held quantities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
	/// Caller-supplied product (or variant) identifier.
	pub id: String,
	/// Display name.
	pub name: String,
	/// Authoritative physical count.
	pub on_hand_stock: u32,
	/// Sum of the quantities of all active reservations for this product.
	///
	/// Maintained in the same transaction as every reservation mutation and
	/// recomputed by inventory reconciliation.
	pub reserved_stock: u32,
	/// Timestamp of the last stock mutation.
	pub updated_at: DateTime<Utc>,
}

impl Product {
	/// Creates a product with no active holds.
	pub fn new(id: impl Into<String>, name: impl Into<String>, on_hand_stock: u32, now: DateTime<Utc>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			on_hand_stock,
			reserved_stock: 0,
			updated_at: now,
		}
	}

	/// Quantity that can still be reserved.
	pub fn available_stock(&self) -> u32 {
		self.on_hand_stock.saturating_sub(self.reserved_stock)
	}
}

/// Status of a stock reservation.
///
/// `Active` is the only non-terminal state. `Expired` is the sweep-specific
/// alias of `Released`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
	Active,
	Committed,
	Released,
	Expired,
}

impl ReservationStatus {
	/// Returns true once no further transition is permitted.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, ReservationStatus::Active)
	}
}

impl fmt::Display for ReservationStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ReservationStatus::Active => "active",
			ReservationStatus::Committed => "committed",
			ReservationStatus::Released => "released",
			ReservationStatus::Expired => "expired",
		};
		f.write_str(s)
	}
}

/// A time-bounded hold on product stock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockReservation {
	pub id: String,
	pub product_id: String,
	pub quantity: u32,
	/// Owning order (or checkout session) reference.
	pub order_ref: String,
	pub status: ReservationStatus,
	pub expires_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl StockReservation {
	/// True when the hold is still active but its expiry lies strictly before `now`.
	pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
		self.status == ReservationStatus::Active && self.expires_at < now
	}
}
