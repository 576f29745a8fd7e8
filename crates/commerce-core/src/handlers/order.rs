//! Order handler for the checkout, payment and fulfilment lifecycle.
//!
//! Every operation runs in one storage transaction: the order lock first, then
//! the locks of the order's products, then (through the ledger poster) the
//! locks of the accounts it posts to. Stock moves, journal entries, invoices
//! and the order's new status are committed together or not at all, and
//! events are published only after the commit.

use crate::engine::event_bus::EventBus;
use crate::state::{OrderStateError, OrderStateMachine};
use crate::utils::seconds;
use chrono::{DateTime, Duration, Utc};
use commerce_config::Config;
use commerce_inventory::{InventoryError, InventoryService};
use commerce_ledger::{postings, LedgerError, LedgerService};
use commerce_storage::{LockDomain, StorageError, StorageService, Transaction};
use commerce_types::{
	truncate_id, Clock, CommerceEvent, DepositPolicy, Invoice, InvoiceStatus, InvoiceType,
	JournalEntry, LedgerEvent, Order, OrderEvent, OrderItem, OrderKind, OrderLine, OrderStatus,
	PaymentRecord, Product, ReferenceType, ReservationStatus, StockEvent, StockReservation,
	StorageKey,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Errors that can occur during order processing.
#[derive(Debug, Error)]
pub enum OrderError {
	#[error(transparent)]
	Inventory(#[from] InventoryError),
	#[error(transparent)]
	Ledger(#[from] LedgerError),
	#[error("Order not found: {0}")]
	NotFound(String),
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition { from: OrderStatus, to: OrderStatus },
	#[error("Payment mismatch: expected {expected}, received {received}")]
	PaymentMismatch { expected: Decimal, received: Decimal },
	#[error("Invalid order: {0}")]
	InvalidOrder(String),
	/// A concurrent writer created the same entity first.
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Storage error: {0}")]
	Storage(String),
}

impl OrderError {
	/// Whether retrying the operation may succeed.
	pub fn is_conflict(&self) -> bool {
		match self {
			OrderError::Conflict(_) => true,
			OrderError::Inventory(e) => e.is_conflict(),
			OrderError::Ledger(e) => e.is_conflict(),
			_ => false,
		}
	}
}

impl From<StorageError> for OrderError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::AlreadyExists(key) => OrderError::Conflict(key),
			other => OrderError::Storage(other.to_string()),
		}
	}
}

impl From<OrderStateError> for OrderError {
	fn from(err: OrderStateError) -> Self {
		match err {
			OrderStateError::Storage(msg) => OrderError::Storage(msg),
			OrderStateError::InvalidTransition { from, to } => {
				OrderError::InvalidTransition { from, to }
			},
			OrderStateError::OrderNotFound(id) => OrderError::NotFound(id),
		}
	}
}

/// Timing and threshold settings of the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
	/// How long a standard checkout holds its stock.
	pub checkout_hold: Duration,
	/// How long past its deadline a pre-order keeps its stock, so the
	/// forfeiture sweep reaches it before the reservation sweep does.
	pub forfeiture_grace: Duration,
	/// Availability at or below which `stock.low` is published.
	pub low_stock_threshold: u32,
}

impl LifecycleSettings {
	pub fn from_config(config: &Config) -> Self {
		Self {
			checkout_hold: seconds(config.inventory.checkout_hold_seconds),
			forfeiture_grace: seconds(config.orders.forfeiture_grace_seconds),
			low_stock_threshold: config.inventory.low_stock_threshold,
		}
	}
}

impl Default for LifecycleSettings {
	fn default() -> Self {
		Self {
			checkout_hold: Duration::minutes(15),
			forfeiture_grace: Duration::days(1),
			low_stock_threshold: 5,
		}
	}
}

/// How a confirmed payment is booked.
#[derive(Debug, Clone, Copy)]
enum PaymentStep {
	/// Standard order paid in full.
	Sale,
	/// Pre-order deposit, held as a liability.
	Deposit,
	/// Pre-order settled; `deposit_applied` moves from the liability to revenue.
	Settle { deposit_applied: Decimal },
}

/// Handler for the order and pre-order lifecycle.
pub struct OrderHandler {
	storage: Arc<StorageService>,
	inventory: Arc<InventoryService>,
	ledger: Arc<LedgerService>,
	state_machine: Arc<OrderStateMachine>,
	event_bus: EventBus,
	clock: Arc<dyn Clock>,
	settings: LifecycleSettings,
}

impl OrderHandler {
	pub fn new(
		storage: Arc<StorageService>,
		inventory: Arc<InventoryService>,
		ledger: Arc<LedgerService>,
		state_machine: Arc<OrderStateMachine>,
		event_bus: EventBus,
		clock: Arc<dyn Clock>,
		settings: LifecycleSettings,
	) -> Self {
		Self {
			storage,
			inventory,
			ledger,
			state_machine,
			event_bus,
			clock,
			settings,
		}
	}

	pub fn settings(&self) -> &LifecycleSettings {
		&self.settings
	}

	/// Places an order, reserving stock for every line.
	///
	/// Either every line gets its hold or none does. Standard orders hold
	/// stock for the checkout window; pre-orders hold it until their deadline
	/// plus the forfeiture grace.
	#[instrument(skip_all, fields(lines = lines.len()))]
	pub async fn create_order(
		&self,
		lines: Vec<OrderLine>,
		policy: DepositPolicy,
	) -> Result<Order, OrderError> {
		let now = self.clock.now();
		let total = order_total(&lines)?;

		let (kind, deposit_amount, deposit_deadline, hold_until) = match policy {
			DepositPolicy::FullPayment => (
				OrderKind::Standard,
				None,
				None,
				now + self.settings.checkout_hold,
			),
			DepositPolicy::Deposit { amount, deadline } => {
				if amount <= Decimal::ZERO || amount >= total {
					return Err(OrderError::InvalidOrder(format!(
						"deposit {} must be positive and below the order total {}",
						amount, total
					)));
				}
				if deadline <= now {
					return Err(OrderError::InvalidOrder(
						"deposit deadline must lie in the future".into(),
					));
				}
				(
					OrderKind::PreOrder,
					Some(amount),
					Some(deadline),
					deadline + self.settings.forfeiture_grace,
				)
			},
		};

		let order_id = uuid::Uuid::new_v4().to_string();
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id.as_str()]).await;
		let product_ids: Vec<&str> = lines.iter().map(|line| line.product_id.as_str()).collect();
		tx.lock(LockDomain::Product, product_ids.clone()).await;

		let mut items = Vec::with_capacity(lines.len());
		let mut reservations = Vec::with_capacity(lines.len());
		for line in &lines {
			let reservation = self
				.inventory
				.reserve_in(&mut tx, &line.product_id, line.quantity, hold_until, &order_id)
				.await?;
			items.push(OrderItem {
				product_id: line.product_id.clone(),
				quantity: line.quantity,
				unit_price: line.unit_price,
				reservation_id: reservation.id.clone(),
			});
			reservations.push(reservation);
		}
		let levels = availability(&tx, product_ids).await?;

		let invoice = match deposit_amount {
			Some(deposit) => new_invoice(&order_id, deposit, InvoiceType::Deposit, now),
			None => new_invoice(&order_id, total, InvoiceType::Full, now),
		};
		let order = Order {
			id: order_id,
			kind,
			status: OrderStatus::Pending,
			items,
			total_amount: total,
			deposit_amount,
			deposit_deadline,
			amount_paid: Decimal::ZERO,
			payments: Vec::new(),
			invoice_ids: vec![invoice.id.clone()],
			cancel_reason: None,
			created_at: now,
			updated_at: now,
		};
		tx.insert(StorageKey::Invoices.as_str(), &invoice.id, &invoice)?;
		tx.insert(StorageKey::Orders.as_str(), &order.id, &order)?;
		tx.commit().await?;

		tracing::info!(
			order_id = %truncate_id(&order.id),
			kind = ?order.kind,
			total = %order.total_amount,
			"Order created"
		);
		for reservation in reservations {
			self.event_bus
				.publish(CommerceEvent::Stock(StockEvent::Reserved { reservation }))
				.ok();
		}
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Created {
				order: order.clone(),
			}))
			.ok();
		self.publish_low_stock(&levels);
		Ok(order)
	}

	/// Applies a gateway payment to an order.
	///
	/// A payment reference already applied to the order is accepted again
	/// without effect.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id), payment_ref = %payment_ref))]
	pub async fn confirm_payment(
		&self,
		order_id: &str,
		amount: Decimal,
		payment_ref: &str,
	) -> Result<Order, OrderError> {
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id]).await;
		let mut order = self.state_machine.load(&tx, order_id).await?;

		if order.has_payment(payment_ref) {
			tracing::debug!("Payment already applied");
			return Ok(order);
		}
		if !order.status.holds_reservations() {
			return Err(OrderError::InvalidTransition {
				from: order.status,
				to: OrderStatus::Processing,
			});
		}

		let step = payment_step(&order, amount)?;
		let (next, description) = match step {
			PaymentStep::Sale => (OrderStatus::Processing, format!("Sale for order {}", order.id)),
			PaymentStep::Deposit => (
				OrderStatus::AwaitingDeposit,
				format!("Deposit for pre-order {}", order.id),
			),
			PaymentStep::Settle { .. } => (
				OrderStatus::Processing,
				format!("Settlement of pre-order {}", order.id),
			),
		};
		self.state_machine.transition(&mut order, next)?;

		tx.lock(LockDomain::Product, order.product_ids()).await;
		let mut levels = BTreeMap::new();
		if next == OrderStatus::Processing {
			for reservation_id in order.reservation_ids() {
				let outcome = self.inventory.commit_in(&mut tx, &reservation_id).await?;
				levels.insert(outcome.reservation.product_id.clone(), outcome.available);
			}
		}

		let accounts = self.ledger.account_map().await?;
		let lines = match step {
			PaymentStep::Sale => postings::sale(&accounts, amount)?,
			PaymentStep::Deposit => postings::deposit_received(&accounts, amount)?,
			PaymentStep::Settle { deposit_applied } => {
				postings::balance_settled(&accounts, amount, deposit_applied)?
			},
		};
		let entry = self
			.ledger
			.post_in(&mut tx, &description, &order.id, ReferenceType::Order, lines)
			.await?;

		let now = self.clock.now();
		let mut invoices = load_invoices(&tx, &order).await?;
		let mut paid_invoice = None;
		for invoice in invoices
			.iter_mut()
			.filter(|invoice| invoice.status == InvoiceStatus::Unpaid)
		{
			mark_paid(invoice, &entry.id, now);
			tx.put(StorageKey::Invoices.as_str(), &invoice.id, invoice)?;
			paid_invoice.get_or_insert_with(|| invoice.id.clone());
		}

		let has_balance_invoice = invoices
			.iter()
			.any(|invoice| invoice.invoice_type == InvoiceType::Balance);
		if order.kind == OrderKind::PreOrder && !has_balance_invoice {
			let deposit = order.deposit_amount.unwrap_or(Decimal::ZERO);
			let mut balance = new_invoice(
				&order.id,
				order.total_amount - deposit,
				InvoiceType::Balance,
				now,
			);
			if next == OrderStatus::Processing {
				mark_paid(&mut balance, &entry.id, now);
			}
			tx.insert(StorageKey::Invoices.as_str(), &balance.id, &balance)?;
			order.invoice_ids.push(balance.id);
		}

		order.payments.push(PaymentRecord {
			payment_ref: payment_ref.to_string(),
			amount,
			invoice_id: paid_invoice.unwrap_or_default(),
			journal_entry_id: entry.id.clone(),
			received_at: now,
		});
		order.amount_paid += amount;
		self.state_machine.save(&mut tx, &order)?;
		tx.commit().await?;

		tracing::info!(amount = %amount, status = %order.status, "Payment confirmed");
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::PaymentConfirmed {
				order_id: order.id.clone(),
				payment_ref: payment_ref.to_string(),
				amount,
				status: order.status,
			}))
			.ok();
		self.publish_posted(&entry);
		self.publish_low_stock(&levels);
		Ok(order)
	}

	/// Cancels an order that has not shipped.
	///
	/// Active holds are released, committed stock goes back on hand, every
	/// recorded payment is reversed and paid invoices become refunded.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<Order, OrderError> {
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id]).await;
		let mut order = self.state_machine.load(&tx, order_id).await?;

		if order.status == OrderStatus::Shipped {
			return Err(OrderError::InvalidTransition {
				from: order.status,
				to: OrderStatus::Cancelled,
			});
		}
		order.cancel_reason = Some(reason.to_string());
		self.state_machine
			.transition(&mut order, OrderStatus::Cancelled)?;

		tx.lock(LockDomain::Product, order.product_ids()).await;
		for reservation_id in order.reservation_ids() {
			let reservation: StockReservation = tx
				.get(StorageKey::Reservations.as_str(), &reservation_id)
				.await?;
			match reservation.status {
				ReservationStatus::Active => {
					self.inventory.release_in(&mut tx, &reservation_id).await?;
				},
				ReservationStatus::Committed => {
					self.inventory.restock_in(&mut tx, &reservation_id).await?;
				},
				ReservationStatus::Released | ReservationStatus::Expired => {},
			}
		}

		let mut seen = HashSet::new();
		let entry_ids: Vec<String> = order
			.payments
			.iter()
			.filter(|payment| seen.insert(payment.journal_entry_id.as_str()))
			.map(|payment| payment.journal_entry_id.clone())
			.collect();
		let reversals = self
			.ledger
			.reverse_all_in(&mut tx, &entry_ids, &format!("Refund for order {}", order.id))
			.await?;

		for mut invoice in load_invoices(&tx, &order).await? {
			if invoice.status == InvoiceStatus::Paid {
				invoice.status = InvoiceStatus::Refunded;
				tx.put(StorageKey::Invoices.as_str(), &invoice.id, &invoice)?;
			}
		}

		self.state_machine.save(&mut tx, &order)?;
		tx.commit().await?;

		tracing::info!(reason = %reason, refunds = reversals.len(), "Order cancelled");
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Cancelled {
				order_id: order.id.clone(),
				reason: reason.to_string(),
			}))
			.ok();
		for reversal in &reversals {
			self.publish_posted(reversal);
		}
		Ok(order)
	}

	/// Marks a paid order as handed to the carrier.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn mark_shipped(&self, order_id: &str) -> Result<Order, OrderError> {
		let order = self.advance(order_id, OrderStatus::Shipped).await?;
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Shipped {
				order_id: order.id.clone(),
			}))
			.ok();
		Ok(order)
	}

	/// Closes a shipped order.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn complete(&self, order_id: &str) -> Result<Order, OrderError> {
		let order = self.advance(order_id, OrderStatus::Completed).await?;
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Completed {
				order_id: order.id.clone(),
			}))
			.ok();
		Ok(order)
	}

	/// Books an expense paid from the bank. Returns the journal entry id.
	#[instrument(skip_all, fields(reference_id = %truncate_id(reference_id)))]
	pub async fn record_expense(
		&self,
		description: &str,
		expense_code: Option<&str>,
		amount: Decimal,
		reference_id: &str,
	) -> Result<String, OrderError> {
		let accounts = self.ledger.account_map().await?;
		let lines = postings::expense(&accounts, expense_code, amount)?;
		let entry_id = self
			.ledger
			.post(description, reference_id, ReferenceType::Expense, lines)
			.await?;

		self.event_bus
			.publish(CommerceEvent::Ledger(LedgerEvent::Posted {
				entry_id: entry_id.clone(),
				reference_id: reference_id.to_string(),
				amount,
			}))
			.ok();
		Ok(entry_id)
	}

	pub async fn order(&self, order_id: &str) -> Result<Order, OrderError> {
		self.storage
			.find(StorageKey::Orders.as_str(), order_id)
			.await?
			.ok_or_else(|| OrderError::NotFound(order_id.to_string()))
	}

	pub async fn orders(&self) -> Result<Vec<Order>, OrderError> {
		Ok(self.storage.list(StorageKey::Orders.as_str()).await?)
	}

	pub async fn invoice(&self, invoice_id: &str) -> Result<Invoice, OrderError> {
		self.storage
			.find(StorageKey::Invoices.as_str(), invoice_id)
			.await?
			.ok_or_else(|| OrderError::NotFound(format!("invoice {}", invoice_id)))
	}

	/// Invoices issued for an order, in issue order.
	pub async fn invoices_for(&self, order_id: &str) -> Result<Vec<Invoice>, OrderError> {
		let order = self.order(order_id).await?;
		let mut invoices = Vec::with_capacity(order.invoice_ids.len());
		for id in &order.invoice_ids {
			invoices.push(self.invoice(id).await?);
		}
		Ok(invoices)
	}

	async fn advance(&self, order_id: &str, to: OrderStatus) -> Result<Order, OrderError> {
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id]).await;
		let order = self
			.state_machine
			.transition_order_status(&mut tx, order_id, to)
			.await?;
		tx.commit().await?;

		tracing::info!(status = %order.status, "Order advanced");
		Ok(order)
	}

	fn publish_posted(&self, entry: &JournalEntry) {
		self.event_bus
			.publish(CommerceEvent::Ledger(LedgerEvent::Posted {
				entry_id: entry.id.clone(),
				reference_id: entry.reference_id.clone(),
				amount: entry.total_debit(),
			}))
			.ok();
	}

	fn publish_low_stock(&self, levels: &BTreeMap<String, u32>) {
		for (product_id, available) in levels {
			if *available > self.settings.low_stock_threshold {
				continue;
			}
			tracing::warn!(product_id = %product_id, available, "Stock low");
			self.event_bus
				.publish(CommerceEvent::Stock(StockEvent::Low {
					product_id: product_id.clone(),
					available: *available,
				}))
				.ok();
		}
	}
}

/// Sums the lines, rejecting empty orders and non-positive quantities or
/// prices.
fn order_total(lines: &[OrderLine]) -> Result<Decimal, OrderError> {
	if lines.is_empty() {
		return Err(OrderError::InvalidOrder("order has no lines".into()));
	}
	for line in lines {
		if line.quantity == 0 {
			return Err(OrderError::InvalidOrder(format!(
				"quantity for {} must be greater than zero",
				line.product_id
			)));
		}
		if line.unit_price.is_sign_negative() {
			return Err(OrderError::InvalidOrder(format!(
				"negative price for {}",
				line.product_id
			)));
		}
	}

	let total: Decimal = lines.iter().map(OrderLine::amount).sum();
	if total <= Decimal::ZERO {
		return Err(OrderError::InvalidOrder("order total must be positive".into()));
	}
	Ok(total)
}

fn payment_step(order: &Order, amount: Decimal) -> Result<PaymentStep, OrderError> {
	let mismatch = |expected: Decimal| OrderError::PaymentMismatch {
		expected,
		received: amount,
	};

	match (order.kind, order.status) {
		(OrderKind::Standard, OrderStatus::Pending) => {
			if amount != order.total_amount {
				return Err(mismatch(order.total_amount));
			}
			Ok(PaymentStep::Sale)
		},
		(OrderKind::PreOrder, OrderStatus::Pending) => {
			let deposit = order.deposit_amount.unwrap_or(order.total_amount);
			if amount == deposit {
				Ok(PaymentStep::Deposit)
			} else if amount == order.total_amount {
				Ok(PaymentStep::Settle {
					deposit_applied: Decimal::ZERO,
				})
			} else {
				Err(mismatch(deposit))
			}
		},
		(OrderKind::PreOrder, OrderStatus::AwaitingDeposit) => {
			if amount != order.outstanding() {
				return Err(mismatch(order.outstanding()));
			}
			Ok(PaymentStep::Settle {
				deposit_applied: order.amount_paid,
			})
		},
		(kind, status) => Err(OrderError::InvalidOrder(format!(
			"{:?} order cannot take a payment while {}",
			kind, status
		))),
	}
}

pub(crate) fn new_invoice(
	order_id: &str,
	amount: Decimal,
	invoice_type: InvoiceType,
	now: DateTime<Utc>,
) -> Invoice {
	Invoice {
		id: uuid::Uuid::new_v4().to_string(),
		order_id: order_id.to_string(),
		amount,
		status: InvoiceStatus::Unpaid,
		invoice_type,
		journal_entry_id: None,
		created_at: now,
		paid_at: None,
	}
}

fn mark_paid(invoice: &mut Invoice, entry_id: &str, now: DateTime<Utc>) {
	invoice.status = InvoiceStatus::Paid;
	invoice.journal_entry_id = Some(entry_id.to_string());
	invoice.paid_at = Some(now);
}

/// Reads the order's invoices through the transaction.
pub(crate) async fn load_invoices(
	tx: &Transaction<'_>,
	order: &Order,
) -> Result<Vec<Invoice>, OrderError> {
	let mut invoices = Vec::with_capacity(order.invoice_ids.len());
	for id in &order.invoice_ids {
		invoices.push(tx.get(StorageKey::Invoices.as_str(), id).await?);
	}
	Ok(invoices)
}

/// Availability per product as staged in the transaction.
async fn availability<'a>(
	tx: &Transaction<'_>,
	product_ids: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, u32>, OrderError> {
	let mut levels = BTreeMap::new();
	for id in product_ids {
		if levels.contains_key(id) {
			continue;
		}
		let product: Product = tx.get(StorageKey::Products.as_str(), id).await?;
		levels.insert(id.to_string(), product.available_stock());
	}
	Ok(levels)
}
