//! Common types module for the commerce core.
//!
//! This module defines the data types shared by the stock reservation
//! manager, the order lifecycle engine and the ledger poster, so that every
//! crate agrees on the persisted shape of products, reservations, orders,
//! invoices, accounts and journal entries.

/// Time source abstraction.
pub mod clock;
/// Event types for inter-service communication.
pub mod events;
/// Products and stock reservations.
pub mod inventory;
/// Chart of accounts and journal entries.
pub mod ledger;
/// Orders, invoices and payments.
pub mod order;
/// Registry trait for pluggable implementations.
pub mod registry;
/// Storage namespaces.
pub mod storage;
/// Utility functions for display formatting.
pub mod utils;
/// Configuration validation types.
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::*;
pub use inventory::*;
pub use ledger::*;
pub use order::*;
pub use registry::*;
pub use storage::*;
pub use utils::truncate_id;
pub use validation::*;
