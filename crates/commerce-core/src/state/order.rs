//! Order state machine implementation.
//!
//! Orders move pending -> (awaiting_deposit) -> processing -> shipped ->
//! completed. Every non-terminal state may be forfeited, and every state up to
//! shipped may be cancelled. The machine works on orders staged in a storage
//! [`Transaction`], so a status change commits together with the stock and
//! ledger writes that justify it.

use commerce_storage::{StorageError, Transaction};
use commerce_types::{Clock, Order, OrderStatus, StorageKey};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during order state management.
#[derive(Debug, Error)]
pub enum OrderStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition { from: OrderStatus, to: OrderStatus },
	#[error("Order not found: {0}")]
	OrderNotFound(String),
}

impl From<StorageError> for OrderStateError {
	fn from(err: StorageError) -> Self {
		OrderStateError::Storage(err.to_string())
	}
}

// Static transition table - each state maps to allowed next states
static TRANSITIONS: Lazy<HashMap<OrderStatus, HashSet<OrderStatus>>> = Lazy::new(|| {
	let mut m = HashMap::new();
	m.insert(
		OrderStatus::Pending,
		HashSet::from([
			OrderStatus::AwaitingDeposit,
			OrderStatus::Processing,
			OrderStatus::Cancelled,
			OrderStatus::Forfeited,
		]),
	);
	m.insert(
		OrderStatus::AwaitingDeposit,
		HashSet::from([
			OrderStatus::Processing,
			OrderStatus::Cancelled,
			OrderStatus::Forfeited,
		]),
	);
	m.insert(
		OrderStatus::Processing,
		HashSet::from([
			OrderStatus::Shipped,
			OrderStatus::Cancelled,
			OrderStatus::Forfeited,
		]),
	);
	m.insert(
		OrderStatus::Shipped,
		HashSet::from([
			OrderStatus::Completed,
			OrderStatus::Cancelled,
			OrderStatus::Forfeited,
		]),
	);
	m.insert(OrderStatus::Completed, HashSet::new());
	m.insert(OrderStatus::Cancelled, HashSet::new());
	m.insert(OrderStatus::Forfeited, HashSet::new());
	m
});

/// Validates and applies order status transitions.
pub struct OrderStateMachine {
	clock: Arc<dyn Clock>,
}

impl OrderStateMachine {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self { clock }
	}

	/// Checks if a state transition is valid
	pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
		TRANSITIONS
			.get(&from)
			.is_some_and(|allowed| allowed.contains(&to))
	}

	/// Reads an order through the transaction.
	pub async fn load(&self, tx: &Transaction<'_>, order_id: &str) -> Result<Order, OrderStateError> {
		tx.find(StorageKey::Orders.as_str(), order_id)
			.await?
			.ok_or_else(|| OrderStateError::OrderNotFound(order_id.to_string()))
	}

	/// Moves `order` to `to`, refusing transitions the table does not allow.
	pub fn transition(&self, order: &mut Order, to: OrderStatus) -> Result<(), OrderStateError> {
		if !Self::is_valid_transition(order.status, to) {
			return Err(OrderStateError::InvalidTransition {
				from: order.status,
				to,
			});
		}
		order.status = to;
		order.updated_at = self.clock.now();
		Ok(())
	}

	/// Stages the order in the transaction.
	pub fn save(&self, tx: &mut Transaction<'_>, order: &Order) -> Result<(), OrderStateError> {
		tx.put(StorageKey::Orders.as_str(), &order.id, order)?;
		Ok(())
	}

	/// Transitions a stored order with validation and stages the result.
	pub async fn transition_order_status(
		&self,
		tx: &mut Transaction<'_>,
		order_id: &str,
		new_status: OrderStatus,
	) -> Result<Order, OrderStateError> {
		let mut order = self.load(tx, order_id).await?;
		self.transition(&mut order, new_status)?;
		self.save(tx, &order)?;
		Ok(order)
	}
}
