//! Order processing types for the commerce core.
//!
//! This module defines customer orders and pre-orders, their items and
//! payments, the invoices issued against them, and the lifecycle status.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an order is paid in one go or secured with a deposit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
	/// Regular checkout, paid in full.
	Standard,
	/// Pre-order / purchase-order secured by a deposit.
	PreOrder,
}

/// Payment terms requested at order creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DepositPolicy {
	/// The whole amount is due at checkout.
	FullPayment,
	/// A deposit secures the stock; the balance is due before `deadline`.
	Deposit {
		amount: Decimal,
		deadline: DateTime<Utc>,
	},
}

/// A requested line at checkout, before stock has been reserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
	pub product_id: String,
	pub quantity: u32,
	pub unit_price: Decimal,
}

impl OrderLine {
	pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: Decimal) -> Self {
		Self {
			product_id: product_id.into(),
			quantity,
			unit_price,
		}
	}

	/// Line total.
	pub fn amount(&self) -> Decimal {
		self.unit_price * Decimal::from(self.quantity)
	}
}

/// An order line backed by a stock reservation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
	pub product_id: String,
	pub quantity: u32,
	pub unit_price: Decimal,
	pub reservation_id: String,
}

/// A gateway payment applied to an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
	/// Gateway reference; applying the same reference twice is a no-op.
	pub payment_ref: String,
	pub amount: Decimal,
	pub invoice_id: String,
	/// Journal entry that recorded the money movement.
	pub journal_entry_id: String,
	pub received_at: DateTime<Utc>,
}

/// Represents a customer order with its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
	/// Unique identifier for this order.
	pub id: String,
	pub kind: OrderKind,
	/// Current status of the order.
	pub status: OrderStatus,
	pub items: Vec<OrderItem>,
	pub total_amount: Decimal,
	/// Deposit required to secure a pre-order.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub deposit_amount: Option<Decimal>,
	/// Deadline for settling a pre-order; unset for standard orders.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub deposit_deadline: Option<DateTime<Utc>>,
	/// Sum of all applied payments.
	pub amount_paid: Decimal,
	#[serde(default)]
	pub payments: Vec<PaymentRecord>,
	#[serde(default)]
	pub invoice_ids: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cancel_reason: Option<String>,
	/// Timestamp when this order was created.
	pub created_at: DateTime<Utc>,
	/// Timestamp when this order was last updated.
	pub updated_at: DateTime<Utc>,
}

impl Order {
	/// Ids of every reservation referenced by the order's items.
	pub fn reservation_ids(&self) -> Vec<String> {
		self.items.iter().map(|item| item.reservation_id.clone()).collect()
	}

	/// Ids of the products referenced by the order, ascending and deduplicated.
	pub fn product_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.items.iter().map(|item| item.product_id.clone()).collect();
		ids.sort();
		ids.dedup();
		ids
	}

	/// Amount still owed on the order.
	pub fn outstanding(&self) -> Decimal {
		self.total_amount - self.amount_paid
	}

	pub fn has_payment(&self, payment_ref: &str) -> bool {
		self.payments.iter().any(|p| p.payment_ref == payment_ref)
	}

	/// True for a pre-order whose deadline lies strictly before `now` while it
	/// can still be forfeited.
	pub fn is_forfeitable(&self, now: DateTime<Utc>) -> bool {
		self.kind == OrderKind::PreOrder
			&& self.status.is_forfeitable()
			&& self.deposit_deadline.is_some_and(|deadline| deadline < now)
	}
}

/// Status of an order in the commerce core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	/// Created, nothing paid yet.
	Pending,
	/// Pre-order deposit received and held as a liability; balance outstanding.
	AwaitingDeposit,
	/// Paid in full, stock committed.
	Processing,
	Shipped,
	Completed,
	Cancelled,
	/// Pre-order not settled before its deadline; deposit recognised as revenue.
	Forfeited,
}

impl OrderStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Forfeited
		)
	}

	/// States in which the order still holds active reservations.
	pub fn holds_reservations(&self) -> bool {
		matches!(self, OrderStatus::Pending | OrderStatus::AwaitingDeposit)
	}

	/// States the sweep may forfeit from.
	pub fn is_forfeitable(&self) -> bool {
		self.holds_reservations()
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OrderStatus::Pending => write!(f, "pending"),
			OrderStatus::AwaitingDeposit => write!(f, "awaiting_deposit"),
			OrderStatus::Processing => write!(f, "processing"),
			OrderStatus::Shipped => write!(f, "shipped"),
			OrderStatus::Completed => write!(f, "completed"),
			OrderStatus::Cancelled => write!(f, "cancelled"),
			OrderStatus::Forfeited => write!(f, "forfeited"),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
	Unpaid,
	Paid,
	Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
	/// Whole order amount.
	Full,
	/// Pre-order deposit.
	Deposit,
	/// Pre-order remainder after the deposit.
	Balance,
}

/// A request for payment issued against an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
	pub id: String,
	pub order_id: String,
	pub amount: Decimal,
	pub status: InvoiceStatus,
	pub invoice_type: InvoiceType,
	/// Journal entry that settled the invoice.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub journal_entry_id: Option<String>,
	pub created_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub paid_at: Option<DateTime<Utc>>,
}
