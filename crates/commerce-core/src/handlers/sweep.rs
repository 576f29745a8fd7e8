//! Time-driven expiry of orders.
//!
//! Two sweeps run here. The checkout sweep cancels standard orders whose stock
//! hold lapsed before payment. The ghost protocol forfeits pre-orders whose
//! balance was not settled by the deadline: their stock goes back on sale and
//! any deposit taken is recognised as revenue.
//!
//! Each order is handled in its own transaction under its order lock and is
//! re-checked once the lock is held, so overlapping or repeated runs act on an
//! order at most once. A failing order is logged and counted; the sweep moves
//! on to the next one.

use crate::engine::event_bus::EventBus;
use crate::handlers::OrderError;
use crate::state::OrderStateMachine;
use chrono::{DateTime, Utc};
use commerce_inventory::InventoryService;
use commerce_ledger::{postings, LedgerService};
use commerce_storage::{LockDomain, StorageService, Transaction};
use commerce_types::{
	truncate_id, CommerceEvent, LedgerEvent, Order, OrderEvent, OrderKind, OrderStatus,
	ReferenceType, ReservationStatus, StockReservation, StorageKey,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Cancel reason recorded on checkouts the sweep closes.
pub const CHECKOUT_EXPIRED: &str = "checkout hold expired";

/// Outcome of one ghost protocol run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForfeitureReport {
	/// Pre-orders moved to forfeited.
	pub forfeited: usize,
	/// Pre-orders that could not be processed this run.
	pub failed: usize,
}

pub struct SweepHandler {
	storage: Arc<StorageService>,
	inventory: Arc<InventoryService>,
	ledger: Arc<LedgerService>,
	state_machine: Arc<OrderStateMachine>,
	event_bus: EventBus,
}

impl SweepHandler {
	pub fn new(
		storage: Arc<StorageService>,
		inventory: Arc<InventoryService>,
		ledger: Arc<LedgerService>,
		state_machine: Arc<OrderStateMachine>,
		event_bus: EventBus,
	) -> Self {
		Self {
			storage,
			inventory,
			ledger,
			state_machine,
			event_bus,
		}
	}

	/// Forfeits every unsettled pre-order whose deadline lies before `now`.
	#[instrument(skip_all)]
	pub async fn expire_overdue_pos(&self, now: DateTime<Utc>) -> Result<ForfeitureReport, OrderError> {
		let candidates: Vec<Order> = self
			.storage
			.list::<Order>(StorageKey::Orders.as_str())
			.await?
			.into_iter()
			.filter(|order| order.is_forfeitable(now))
			.collect();

		let mut report = ForfeitureReport::default();
		for candidate in candidates {
			match self.forfeit(&candidate.id, now).await {
				Ok(true) => report.forfeited += 1,
				Ok(false) => {},
				Err(e) => {
					report.failed += 1;
					tracing::error!(
						order_id = %truncate_id(&candidate.id),
						error = %e,
						"Failed to forfeit pre-order"
					);
				},
			}
		}

		tracing::info!(
			forfeited = report.forfeited,
			failed = report.failed,
			"Ghost protocol sweep finished"
		);
		Ok(report)
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	async fn forfeit(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool, OrderError> {
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id]).await;
		let mut order = self.state_machine.load(&tx, order_id).await?;
		if !order.is_forfeitable(now) {
			return Ok(false);
		}
		self.state_machine
			.transition(&mut order, OrderStatus::Forfeited)?;

		tx.lock(LockDomain::Product, order.product_ids()).await;
		for reservation in order_reservations(&tx, &order).await? {
			if reservation.status == ReservationStatus::Active {
				self.inventory.expire_in(&mut tx, &reservation.id).await?;
			}
		}

		let deposit = order.amount_paid;
		let entry = if deposit > Decimal::ZERO {
			let accounts = self.ledger.account_map().await?;
			let lines = postings::deposit_forfeited(&accounts, deposit)?;
			let entry = self
				.ledger
				.post_in(
					&mut tx,
					&format!("Forfeited deposit for pre-order {}", order.id),
					&order.id,
					ReferenceType::Order,
					lines,
				)
				.await?;
			Some(entry)
		} else {
			None
		};

		self.state_machine.save(&mut tx, &order)?;
		tx.commit().await?;

		tracing::info!(deposit = %deposit, "Pre-order forfeited");
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Forfeited {
				order_id: order.id.clone(),
				deposit_forfeited: deposit,
				deadline: order.deposit_deadline.unwrap_or(now),
			}))
			.ok();
		if let Some(entry) = entry {
			self.event_bus
				.publish(CommerceEvent::Ledger(LedgerEvent::Posted {
					entry_id: entry.id,
					reference_id: entry.reference_id,
					amount: deposit,
				}))
				.ok();
		}
		Ok(true)
	}

	/// Cancels standard checkouts whose stock hold lapsed before payment.
	/// Returns how many orders were cancelled.
	#[instrument(skip_all)]
	pub async fn expire_stale_checkouts(&self, now: DateTime<Utc>) -> Result<usize, OrderError> {
		let reservations: HashMap<String, StockReservation> = self
			.storage
			.list::<StockReservation>(StorageKey::Reservations.as_str())
			.await?
			.into_iter()
			.map(|reservation| (reservation.id.clone(), reservation))
			.collect();

		let candidates: Vec<Order> = self
			.storage
			.list::<Order>(StorageKey::Orders.as_str())
			.await?
			.into_iter()
			.filter(|order| order.kind == OrderKind::Standard && order.status == OrderStatus::Pending)
			.filter(|order| {
				order.items.iter().any(|item| {
					reservations
						.get(&item.reservation_id)
						.is_none_or(|r| hold_lapsed(r, now))
				})
			})
			.collect();

		let mut cancelled = 0;
		for candidate in candidates {
			match self.cancel_lapsed(&candidate.id, now).await {
				Ok(true) => cancelled += 1,
				Ok(false) => {},
				Err(e) => {
					tracing::warn!(
						order_id = %truncate_id(&candidate.id),
						error = %e,
						"Failed to close lapsed checkout"
					);
				},
			}
		}

		if cancelled > 0 {
			tracing::info!(cancelled, "Closed lapsed checkouts");
		}
		Ok(cancelled)
	}

	async fn cancel_lapsed(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool, OrderError> {
		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Order, [order_id]).await;
		let mut order = self.state_machine.load(&tx, order_id).await?;
		if order.kind != OrderKind::Standard || order.status != OrderStatus::Pending {
			return Ok(false);
		}

		tx.lock(LockDomain::Product, order.product_ids()).await;
		let reservations = order_reservations(&tx, &order).await?;
		if !reservations.iter().any(|r| hold_lapsed(r, now)) {
			return Ok(false);
		}

		for reservation in &reservations {
			if reservation.status == ReservationStatus::Active {
				self.inventory.expire_in(&mut tx, &reservation.id).await?;
			}
		}
		order.cancel_reason = Some(CHECKOUT_EXPIRED.to_string());
		self.state_machine
			.transition(&mut order, OrderStatus::Cancelled)?;
		self.state_machine.save(&mut tx, &order)?;
		tx.commit().await?;

		tracing::debug!(order_id = %truncate_id(order_id), "Checkout expired");
		self.event_bus
			.publish(CommerceEvent::Order(OrderEvent::Cancelled {
				order_id: order.id,
				reason: CHECKOUT_EXPIRED.to_string(),
			}))
			.ok();
		Ok(true)
	}
}

/// An overdue hold, or one some other path already closed.
fn hold_lapsed(reservation: &StockReservation, now: DateTime<Utc>) -> bool {
	reservation.is_overdue(now)
		|| matches!(
			reservation.status,
			ReservationStatus::Released | ReservationStatus::Expired
		)
}

async fn order_reservations(
	tx: &Transaction<'_>,
	order: &Order,
) -> Result<Vec<StockReservation>, OrderError> {
	let mut reservations = Vec::with_capacity(order.items.len());
	for item in &order.items {
		reservations.push(
			tx.get(StorageKey::Reservations.as_str(), &item.reservation_id)
				.await?,
		);
	}
	Ok(reservations)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handlers::fixtures::{fixture, Fixture};
	use chrono::Duration;
	use commerce_types::{Clock, DepositPolicy, MappingKey, OrderLine};

	async fn pre_order(f: &Fixture, quantity: u32, deadline: DateTime<Utc>) -> Order {
		f.orders
			.create_order(
				vec![OrderLine::new("sku-po", quantity, Decimal::from(250))],
				DepositPolicy::Deposit {
					amount: Decimal::from(100),
					deadline,
				},
			)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn test_forfeits_one_millisecond_past_deadline() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 5).await.unwrap();
		let deadline = f.clock.now() + Duration::days(14);
		let order = pre_order(&f, 2, deadline).await;
		f.orders
			.confirm_payment(&order.id, Decimal::from(100), "dep-1")
			.await
			.unwrap();
		assert_eq!(f.inventory.available_stock("sku-po").await.unwrap(), 3);
		let mut events = f.event_bus.subscribe();

		let now = deadline + Duration::milliseconds(1);
		f.clock.set(now);
		let report = f.sweep.expire_overdue_pos(now).await.unwrap();

		assert_eq!(report, ForfeitureReport { forfeited: 1, failed: 0 });
		let forfeited = f.orders.order(&order.id).await.unwrap();
		assert_eq!(forfeited.status, OrderStatus::Forfeited);
		let reservation = f
			.inventory
			.reservation(&order.items[0].reservation_id)
			.await
			.unwrap();
		assert_eq!(reservation.status, ReservationStatus::Expired);
		assert_eq!(f.inventory.available_stock("sku-po").await.unwrap(), 5);

		let deposit = f.ledger.account_for(MappingKey::CustomerDeposit).await.unwrap();
		let revenue = f.ledger.account_for(MappingKey::PoRevenue).await.unwrap();
		assert_eq!(deposit.balance, Decimal::ZERO);
		assert_eq!(revenue.balance, Decimal::from(100));
		assert!(f.ledger.trial_balance().await.unwrap().is_balanced());

		let mut published = false;
		while let Ok(event) = events.try_recv() {
			if let CommerceEvent::Order(OrderEvent::Forfeited {
				order_id,
				deposit_forfeited,
				deadline: at,
			}) = event
			{
				assert_eq!(order_id, order.id);
				assert_eq!(deposit_forfeited, Decimal::from(100));
				assert_eq!(at, deadline);
				published = true;
			}
		}
		assert!(published);

		let again = f.sweep.expire_overdue_pos(now).await.unwrap();
		assert_eq!(again, ForfeitureReport::default());
		assert_eq!(f.ledger.entries_for(&order.id).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn test_deadline_is_exclusive() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 5).await.unwrap();
		let deadline = f.clock.now() + Duration::days(1);
		let order = pre_order(&f, 1, deadline).await;

		let report = f.sweep.expire_overdue_pos(deadline).await.unwrap();
		assert_eq!(report.forfeited, 0);
		assert_eq!(
			f.orders.order(&order.id).await.unwrap().status,
			OrderStatus::Pending
		);
	}

	#[tokio::test]
	async fn test_unpaid_pre_order_forfeits_without_posting() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 5).await.unwrap();
		let deadline = f.clock.now() + Duration::days(1);
		let order = pre_order(&f, 1, deadline).await;

		let report = f
			.sweep
			.expire_overdue_pos(deadline + Duration::seconds(1))
			.await
			.unwrap();
		assert_eq!(report.forfeited, 1);
		assert!(f.ledger.entries_for(&order.id).await.unwrap().is_empty());
		assert_eq!(f.inventory.available_stock("sku-po").await.unwrap(), 5);
	}

	#[tokio::test]
	async fn test_settled_pre_order_is_left_alone() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 5).await.unwrap();
		let deadline = f.clock.now() + Duration::days(1);
		let order = pre_order(&f, 1, deadline).await;
		f.orders
			.confirm_payment(&order.id, Decimal::from(250), "full-1")
			.await
			.unwrap();

		let report = f
			.sweep
			.expire_overdue_pos(deadline + Duration::days(2))
			.await
			.unwrap();
		assert_eq!(report.forfeited, 0);
		assert_eq!(
			f.orders.order(&order.id).await.unwrap().status,
			OrderStatus::Processing
		);
	}

	#[tokio::test]
	async fn test_failures_are_counted_and_the_batch_continues() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 5).await.unwrap();
		let deadline = f.clock.now() + Duration::days(1);
		let healthy = pre_order(&f, 1, deadline).await;

		// An order whose reservation row is missing cannot be forfeited.
		let mut broken = pre_order(&f, 1, deadline).await;
		broken.id = "broken-order".into();
		broken.items[0].reservation_id = "missing-reservation".into();
		f.storage
			.store(StorageKey::Orders.as_str(), &broken.id, &broken)
			.await
			.unwrap();

		let report = f
			.sweep
			.expire_overdue_pos(deadline + Duration::seconds(1))
			.await
			.unwrap();
		assert_eq!(report.forfeited, 2);
		assert_eq!(report.failed, 1);
		assert_eq!(
			f.orders.order(&healthy.id).await.unwrap().status,
			OrderStatus::Forfeited
		);
		assert_eq!(
			f.orders.order("broken-order").await.unwrap().status,
			OrderStatus::Pending
		);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_overlapping_runs_forfeit_once() {
		let f = fixture().await;
		f.inventory.create_product("sku-po", "Collector Set", 10).await.unwrap();
		let deadline = f.clock.now() + Duration::days(1);
		for i in 0..4 {
			let order = pre_order(&f, 1, deadline).await;
			f.orders
				.confirm_payment(&order.id, Decimal::from(100), &format!("dep-{}", i))
				.await
				.unwrap();
		}

		let sweep = Arc::new(f.sweep);
		let now = deadline + Duration::minutes(1);
		let runs = (0..3).map(|_| {
			let sweep = sweep.clone();
			tokio::spawn(async move { sweep.expire_overdue_pos(now).await.unwrap() })
		});
		let total: usize = futures::future::join_all(runs)
			.await
			.into_iter()
			.map(|r| r.unwrap().forfeited)
			.sum();

		assert_eq!(total, 4);
		let revenue = f.ledger.account_for(MappingKey::PoRevenue).await.unwrap();
		assert_eq!(revenue.balance, Decimal::from(400));
		assert_eq!(f.inventory.available_stock("sku-po").await.unwrap(), 10);
	}

	#[tokio::test]
	async fn test_lapsed_checkout_is_cancelled() {
		let f = fixture().await;
		f.inventory.create_product("sku-a", "Booster Box", 3).await.unwrap();
		f.inventory.create_product("sku-po", "Collector Set", 3).await.unwrap();
		let order = f
			.orders
			.create_order(
				vec![OrderLine::new("sku-a", 2, Decimal::from(90))],
				DepositPolicy::FullPayment,
			)
			.await
			.unwrap();
		let po = pre_order(&f, 1, f.clock.now() + Duration::days(30)).await;

		let early = f
			.sweep
			.expire_stale_checkouts(f.clock.now() + Duration::minutes(15))
			.await
			.unwrap();
		assert_eq!(early, 0);

		let now = f.clock.now() + Duration::minutes(16);
		assert_eq!(f.sweep.expire_stale_checkouts(now).await.unwrap(), 1);
		assert_eq!(f.sweep.expire_stale_checkouts(now).await.unwrap(), 0);

		let cancelled = f.orders.order(&order.id).await.unwrap();
		assert_eq!(cancelled.status, OrderStatus::Cancelled);
		assert_eq!(cancelled.cancel_reason.as_deref(), Some(CHECKOUT_EXPIRED));
		let reservation = f
			.inventory
			.reservation(&order.items[0].reservation_id)
			.await
			.unwrap();
		assert_eq!(reservation.status, ReservationStatus::Expired);
		assert_eq!(f.inventory.available_stock("sku-a").await.unwrap(), 3);
		assert_eq!(
			f.orders.order(&po.id).await.unwrap().status,
			OrderStatus::Pending
		);
	}

	#[tokio::test]
	async fn test_checkout_closed_when_hold_already_expired() {
		let f = fixture().await;
		f.inventory.create_product("sku-a", "Booster Box", 3).await.unwrap();
		let order = f
			.orders
			.create_order(
				vec![OrderLine::new("sku-a", 1, Decimal::from(90))],
				DepositPolicy::FullPayment,
			)
			.await
			.unwrap();
		f.inventory
			.expire(&order.items[0].reservation_id)
			.await
			.unwrap();

		assert_eq!(f.sweep.expire_stale_checkouts(f.clock.now()).await.unwrap(), 1);
		assert_eq!(
			f.orders.order(&order.id).await.unwrap().status,
			OrderStatus::Cancelled
		);
		assert_eq!(f.inventory.available_stock("sku-a").await.unwrap(), 3);
	}
}
