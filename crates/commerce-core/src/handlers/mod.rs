//! Handlers for the order lifecycle and the time-driven sweeps.
//!
//! The order handler serves checkout, payment, shipment and cancellation
//! requests; the sweep handler expires lapsed checkouts and forfeits pre-orders
//! whose balance was never settled.

pub mod order;
pub mod sweep;

#[cfg(test)]
pub(crate) mod fixtures;

pub use order::{LifecycleSettings, OrderError, OrderHandler};
pub use sweep::{ForfeitureReport, SweepHandler};
