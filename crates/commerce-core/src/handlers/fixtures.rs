//! Shared wiring for handler and engine tests.

use crate::engine::event_bus::EventBus;
use crate::handlers::{LifecycleSettings, OrderHandler, SweepHandler};
use crate::state::OrderStateMachine;
use chrono::{DateTime, Duration, Utc};
use commerce_inventory::InventoryService;
use commerce_ledger::LedgerService;
use commerce_storage::{implementations::memory::MemoryStorage, StorageService};
use commerce_types::{default_chart, AccountSeed, Clock, ManualClock};
use std::sync::Arc;

pub(crate) struct Fixture {
	pub storage: Arc<StorageService>,
	pub clock: Arc<ManualClock>,
	pub inventory: Arc<InventoryService>,
	pub ledger: Arc<LedgerService>,
	pub event_bus: EventBus,
	pub orders: OrderHandler,
	pub sweep: SweepHandler,
}

pub(crate) fn start() -> DateTime<Utc> {
	"2026-03-01T12:00:00Z".parse().unwrap()
}

pub(crate) fn settings() -> LifecycleSettings {
	LifecycleSettings {
		checkout_hold: Duration::minutes(15),
		forfeiture_grace: Duration::days(1),
		low_stock_threshold: 2,
	}
}

/// Memory-backed services with the default chart seeded.
pub(crate) async fn fixture() -> Fixture {
	fixture_with_chart(&default_chart()).await
}

pub(crate) async fn fixture_with_chart(chart: &[AccountSeed]) -> Fixture {
	let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
	let clock = Arc::new(ManualClock::new(start()));
	let time: Arc<dyn Clock> = clock.clone();
	let inventory = Arc::new(InventoryService::new(storage.clone(), time.clone()));
	let ledger = Arc::new(LedgerService::new(storage.clone(), time.clone()));
	ledger.seed_chart(chart).await.unwrap();

	let event_bus = EventBus::new(256);
	let state_machine = Arc::new(OrderStateMachine::new(time.clone()));
	let orders = OrderHandler::new(
		storage.clone(),
		inventory.clone(),
		ledger.clone(),
		state_machine.clone(),
		event_bus.clone(),
		time.clone(),
		settings(),
	);
	let sweep = SweepHandler::new(
		storage.clone(),
		inventory.clone(),
		ledger.clone(),
		state_machine,
		event_bus.clone(),
	);

	Fixture {
		storage,
		clock,
		inventory,
		ledger,
		event_bus,
		orders,
		sweep,
	}
}
