//! Event types for inter-service communication.
//!
//! Events are published on the engine's event bus after the transaction that
//! caused them has committed. Consumers (notification dispatch, logging) never
//! feed back into the committed state.

use crate::{Order, OrderStatus, StockReservation};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main event type encompassing all commerce events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommerceEvent {
	/// Events from the order lifecycle.
	Order(OrderEvent),
	/// Events from the stock reservation manager.
	Stock(StockEvent),
	/// Events from the ledger poster.
	Ledger(LedgerEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
	Created { order: Order },
	PaymentConfirmed {
		order_id: String,
		payment_ref: String,
		amount: Decimal,
		status: OrderStatus,
	},
	Shipped { order_id: String },
	Completed { order_id: String },
	Cancelled { order_id: String, reason: String },
	/// A pre-order was not settled before its deadline.
	Forfeited {
		order_id: String,
		deposit_forfeited: Decimal,
		deadline: DateTime<Utc>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StockEvent {
	Reserved { reservation: StockReservation },
	/// Availability dropped to or below the configured threshold.
	Low { product_id: String, available: u32 },
	/// Reservations expired by the sweep.
	Expired { count: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerEvent {
	Posted {
		entry_id: String,
		reference_id: String,
		amount: Decimal,
	},
}

impl CommerceEvent {
	/// Notification topic for events that leave the core, if any.
	pub fn topic(&self) -> Option<&'static str> {
		match self {
			CommerceEvent::Order(OrderEvent::Created { .. }) => Some("order.created"),
			CommerceEvent::Order(OrderEvent::PaymentConfirmed { .. }) => Some("payment.confirmed"),
			CommerceEvent::Order(OrderEvent::Cancelled { .. }) => Some("order.cancelled"),
			CommerceEvent::Order(OrderEvent::Forfeited { .. }) => Some("order.forfeited"),
			CommerceEvent::Stock(StockEvent::Low { .. }) => Some("stock.low"),
			_ => None,
		}
	}
}
