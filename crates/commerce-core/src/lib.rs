//! Commerce engine for the transactional core.
//!
//! This crate wires the stock reservation manager and the ledger poster into
//! the order and pre-order lifecycle, runs the time-driven expiry sweeps, and
//! fans committed events out to notification dispatchers. It also provides the
//! builder that assembles an engine from configuration and pluggable factories.

pub mod builder;
pub mod engine;
pub mod handlers;
pub mod notifications;
pub mod recovery;
pub mod state;
pub mod utils;

pub use builder::{BuilderError, CommerceBuilder, CommerceFactories};
pub use engine::{event_bus::EventBus, CommerceEngine, EngineError};
pub use handlers::{ForfeitureReport, OrderError, OrderHandler, SweepHandler};
pub use recovery::{RecoveryReport, RecoveryService};
