//! Storage-related types for the commerce core.

use std::str::FromStr;

/// Storage keys for different data collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Products and their stock counters
	Products,
	/// Stock reservations
	Reservations,
	/// Customer orders and pre-orders
	Orders,
	/// Invoices issued against orders
	Invoices,
	/// Chart of accounts
	Accounts,
	/// Append-only journal entries
	JournalEntries,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Products => "products",
			StorageKey::Reservations => "reservations",
			StorageKey::Orders => "orders",
			StorageKey::Invoices => "invoices",
			StorageKey::Accounts => "accounts",
			StorageKey::JournalEntries => "journal_entries",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Products,
			Self::Reservations,
			Self::Orders,
			Self::Invoices,
			Self::Accounts,
			Self::JournalEntries,
		]
		.into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::all().find(|key| key.as_str() == s).ok_or(())
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
