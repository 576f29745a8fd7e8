//! State management for orders.
//!
//! This module provides the order state machine: the table of permitted
//! lifecycle transitions and the helpers that apply them to an order staged in
//! a storage transaction.

pub mod order;

pub use order::{OrderStateError, OrderStateMachine};
