//! Startup reconciliation of persisted state.
//!
//! Every business operation commits as one atomic batch, so a crash cannot
//! leave half an operation behind. What can drift is derived data: the cached
//! reserved-stock counters and the account balances. Recovery repairs the
//! counters from the reservations, replays the journal against the balances,
//! and checks that every order's reservations match its status.

use commerce_inventory::InventoryService;
use commerce_ledger::LedgerService;
use commerce_storage::StorageService;
use commerce_types::{truncate_id, Order, OrderStatus, ReservationStatus, StockReservation, StorageKey};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Errors that can occur during recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Inventory error: {0}")]
	Inventory(String),
	#[error("Ledger error: {0}")]
	Ledger(String),
}

/// Report of the recovery operation.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Products whose reserved counter was rebuilt.
	pub repaired_products: usize,
	/// Accounts whose stored balance disagrees with the journal.
	pub balance_drifts: usize,
	pub orders_checked: usize,
	/// Orders whose reservations do not match their status.
	pub inconsistent_orders: Vec<String>,
	pub trial_balance_balanced: bool,
}

impl RecoveryReport {
	pub fn is_clean(&self) -> bool {
		self.balance_drifts == 0 && self.inconsistent_orders.is_empty() && self.trial_balance_balanced
	}
}

pub struct RecoveryService {
	storage: Arc<StorageService>,
	inventory: Arc<InventoryService>,
	ledger: Arc<LedgerService>,
}

impl RecoveryService {
	pub fn new(storage: Arc<StorageService>, inventory: Arc<InventoryService>, ledger: Arc<LedgerService>) -> Self {
		Self {
			storage,
			inventory,
			ledger,
		}
	}

	/// Reconciles stock counters, ledger balances and order reservations.
	#[instrument(skip_all)]
	pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
		tracing::info!("Starting state reconciliation");
		let mut report = RecoveryReport {
			repaired_products: self
				.inventory
				.reconcile()
				.await
				.map_err(|e| RecoveryError::Inventory(e.to_string()))?,
			..Default::default()
		};

		let drifts = self
			.ledger
			.verify()
			.await
			.map_err(|e| RecoveryError::Ledger(e.to_string()))?;
		for drift in &drifts {
			tracing::error!(
				account = %drift.code,
				recorded = %drift.recorded,
				computed = %drift.computed,
				"Account balance disagrees with journal"
			);
		}
		report.balance_drifts = drifts.len();

		let orders = self
			.storage
			.list::<Order>(StorageKey::Orders.as_str())
			.await
			.map_err(|e| RecoveryError::Storage(e.to_string()))?;
		let reservations: HashMap<String, StockReservation> = self
			.storage
			.list::<StockReservation>(StorageKey::Reservations.as_str())
			.await
			.map_err(|e| RecoveryError::Storage(e.to_string()))?
			.into_iter()
			.map(|r| (r.id.clone(), r))
			.collect();

		report.orders_checked = orders.len();
		for order in &orders {
			if let Some(problem) = reservation_mismatch(order, &reservations) {
				tracing::warn!(
					order_id = %truncate_id(&order.id),
					status = %order.status,
					problem = %problem,
					"Order reservations inconsistent with status"
				);
				report.inconsistent_orders.push(order.id.clone());
			}
		}

		let trial_balance = self
			.ledger
			.trial_balance()
			.await
			.map_err(|e| RecoveryError::Ledger(e.to_string()))?;
		report.trial_balance_balanced = trial_balance.is_balanced();
		if !report.trial_balance_balanced {
			tracing::error!(
				debit_normal = %trial_balance.debit_normal_total,
				credit_normal = %trial_balance.credit_normal_total,
				"Trial balance does not hold"
			);
		}

		tracing::info!(
			repaired_products = report.repaired_products,
			balance_drifts = report.balance_drifts,
			orders_checked = report.orders_checked,
			inconsistent_orders = report.inconsistent_orders.len(),
			"State reconciliation finished"
		);
		Ok(report)
	}
}

/// Describes the first reservation that cannot belong to an order in its
/// current status.
fn reservation_mismatch(order: &Order, reservations: &HashMap<String, StockReservation>) -> Option<String> {
	for id in order.reservation_ids() {
		let Some(reservation) = reservations.get(&id) else {
			return Some(format!("reservation {} missing", id));
		};
		let allowed = match order.status {
			// A lapsed checkout hold may already be expired by the sweep.
			OrderStatus::Pending | OrderStatus::AwaitingDeposit => matches!(
				reservation.status,
				ReservationStatus::Active | ReservationStatus::Expired
			),
			OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Completed => {
				reservation.status == ReservationStatus::Committed
			},
			OrderStatus::Cancelled | OrderStatus::Forfeited => reservation.status.is_terminal(),
		};
		if !allowed {
			return Some(format!("reservation {} is {}", id, reservation.status));
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handlers::fixtures::fixture;
	use commerce_types::{DepositPolicy, OrderLine, Product};
	use rust_decimal::Decimal;

	#[tokio::test]
	async fn test_clean_state_reports_nothing() {
		let f = fixture().await;
		f.inventory.create_product("sku-1", "Booster Box", 5).await.unwrap();
		let order = f
			.orders
			.create_order(vec![OrderLine::new("sku-1", 2, Decimal::new(50, 0))], DepositPolicy::FullPayment)
			.await
			.unwrap();
		f.orders
			.confirm_payment(&order.id, Decimal::new(100, 0), "pay-1")
			.await
			.unwrap();

		let recovery = RecoveryService::new(f.storage.clone(), f.inventory.clone(), f.ledger.clone());
		let report = recovery.recover().await.unwrap();
		assert_eq!(report.orders_checked, 1);
		assert_eq!(report.repaired_products, 0);
		assert!(report.is_clean());
	}

	#[tokio::test]
	async fn test_repairs_counters_and_flags_orders() {
		let f = fixture().await;
		f.inventory.create_product("sku-1", "Booster Box", 5).await.unwrap();
		let order = f
			.orders
			.create_order(vec![OrderLine::new("sku-1", 2, Decimal::new(50, 0))], DepositPolicy::FullPayment)
			.await
			.unwrap();

		// Corrupt the cached counter and the order status behind the services' back.
		let mut product: Product = f.storage.retrieve(StorageKey::Products.as_str(), "sku-1").await.unwrap();
		product.reserved_stock = 4;
		f.storage
			.update(StorageKey::Products.as_str(), "sku-1", &product)
			.await
			.unwrap();
		let mut stored = f.orders.order(&order.id).await.unwrap();
		stored.status = OrderStatus::Processing;
		f.storage
			.update(StorageKey::Orders.as_str(), &stored.id, &stored)
			.await
			.unwrap();

		let recovery = RecoveryService::new(f.storage.clone(), f.inventory.clone(), f.ledger.clone());
		let report = recovery.recover().await.unwrap();
		assert_eq!(report.repaired_products, 1);
		assert_eq!(report.inconsistent_orders, vec![order.id.clone()]);
		assert!(!report.is_clean());
		assert_eq!(f.inventory.available_stock("sku-1").await.unwrap(), 3);
	}
}
