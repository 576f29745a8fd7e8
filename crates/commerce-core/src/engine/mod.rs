//! Commerce engine that ties the lifecycle handlers to their background work.
//!
//! This module contains the CommerceEngine struct, the entry point callers
//! use for checkout, payment and cancellation. When run as a service it
//! drives the expiry sweeps on their intervals, cleans up storage and idle
//! locks, and routes committed events to the notification dispatchers.

pub mod event_bus;
pub mod lifecycle;
pub mod scheduler;

use crate::handlers::{ForfeitureReport, LifecycleSettings, OrderError, OrderHandler, SweepHandler};
use crate::notifications::NotificationService;
use crate::state::OrderStateMachine;
use chrono::{DateTime, Utc};
use commerce_config::Config;
use commerce_inventory::InventoryService;
use commerce_ledger::LedgerService;
use commerce_storage::StorageService;
use commerce_types::{Clock, CommerceEvent, DepositPolicy, Invoice, Order, OrderLine, StockEvent};
use rust_decimal::Decimal;
use scheduler::{IntervalScheduler, Job, Scheduler};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast::error::RecvError, Semaphore};

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
	#[error("Handler error: {0}")]
	Handler(String),
}

/// Notification deliveries the engine loop runs at once.
pub const MAX_CONCURRENT_DELIVERIES: usize = 100;

/// Events buffered per in-flight delivery before the engine loop lags.
pub const EVENTS_PER_DELIVERY_SLOT: usize = 10;

/// Outcome of one reservation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ReservationSweep {
	/// Standard checkouts cancelled because their hold lapsed.
	pub cancelled_checkouts: usize,
	/// Remaining overdue reservations moved to expired.
	pub expired_reservations: usize,
}

/// Main commerce engine.
#[derive(Clone)]
pub struct CommerceEngine {
	pub(crate) config: Config,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) inventory: Arc<InventoryService>,
	pub(crate) ledger: Arc<LedgerService>,
	/// Event bus for committed events.
	pub(crate) event_bus: event_bus::EventBus,
	pub(crate) order_handler: Arc<OrderHandler>,
	pub(crate) sweep_handler: Arc<SweepHandler>,
	pub(crate) notifications: Arc<NotificationService>,
	/// Drives the sweeps while the engine runs.
	pub(crate) scheduler: Arc<dyn Scheduler>,
	pub(crate) clock: Arc<dyn Clock>,
	/// Events the loop skipped after lagging behind the bus.
	pub(crate) lagged_events: Arc<AtomicU64>,
}

impl CommerceEngine {
	/// Creates a new engine over already initialised services.
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		inventory: Arc<InventoryService>,
		ledger: Arc<LedgerService>,
		event_bus: event_bus::EventBus,
		notifications: NotificationService,
		clock: Arc<dyn Clock>,
	) -> Self {
		let state_machine = Arc::new(OrderStateMachine::new(clock.clone()));

		let order_handler = Arc::new(OrderHandler::new(
			storage.clone(),
			inventory.clone(),
			ledger.clone(),
			state_machine.clone(),
			event_bus.clone(),
			clock.clone(),
			LifecycleSettings::from_config(&config),
		));

		let sweep_handler = Arc::new(SweepHandler::new(
			storage.clone(),
			inventory.clone(),
			ledger.clone(),
			state_machine,
			event_bus.clone(),
		));

		Self {
			config,
			storage,
			inventory,
			ledger,
			event_bus,
			order_handler,
			sweep_handler,
			notifications: Arc::new(notifications),
			scheduler: Arc::new(IntervalScheduler::new()),
			clock,
			lagged_events: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Places an order, reserving stock for every line.
	pub async fn create_order(&self, lines: Vec<OrderLine>, policy: DepositPolicy) -> Result<Order, OrderError> {
		self.order_handler.create_order(lines, policy).await
	}

	/// Applies a payment gateway confirmation.
	pub async fn confirm_payment(
		&self,
		order_id: &str,
		amount: Decimal,
		payment_ref: &str,
	) -> Result<Order, OrderError> {
		self.order_handler
			.confirm_payment(order_id, amount, payment_ref)
			.await
	}

	pub async fn cancel(&self, order_id: &str, reason: &str) -> Result<Order, OrderError> {
		self.order_handler.cancel(order_id, reason).await
	}

	pub async fn mark_shipped(&self, order_id: &str) -> Result<Order, OrderError> {
		self.order_handler.mark_shipped(order_id).await
	}

	pub async fn complete(&self, order_id: &str) -> Result<Order, OrderError> {
		self.order_handler.complete(order_id).await
	}

	pub async fn record_expense(
		&self,
		description: &str,
		expense_code: Option<&str>,
		amount: Decimal,
		reference_id: &str,
	) -> Result<String, OrderError> {
		self.order_handler
			.record_expense(description, expense_code, amount, reference_id)
			.await
	}

	pub async fn order(&self, order_id: &str) -> Result<Order, OrderError> {
		self.order_handler.order(order_id).await
	}

	pub async fn invoice(&self, invoice_id: &str) -> Result<Invoice, OrderError> {
		self.order_handler.invoice(invoice_id).await
	}

	/// Reservation tick: cancels lapsed checkouts, then expires every other
	/// overdue reservation.
	///
	/// Safe to run repeatedly and concurrently; an already expired hold is
	/// never touched twice.
	pub async fn sweep_reservations(&self, now: DateTime<Utc>) -> Result<ReservationSweep, EngineError> {
		let cancelled_checkouts = self
			.sweep_handler
			.expire_stale_checkouts(now)
			.await
			.map_err(|e| EngineError::Handler(format!("Failed to expire checkouts: {}", e)))?;
		let expired_reservations = self
			.inventory
			.expire_overdue(now)
			.await
			.map_err(|e| EngineError::Service(format!("Failed to expire reservations: {}", e)))?;

		if expired_reservations > 0 {
			self.event_bus
				.publish(CommerceEvent::Stock(StockEvent::Expired {
					count: expired_reservations,
				}))
				.ok();
		}
		Ok(ReservationSweep {
			cancelled_checkouts,
			expired_reservations,
		})
	}

	/// Forfeits every pre-order whose deposit deadline passed before `now`.
	pub async fn forfeit_overdue(&self, now: DateTime<Utc>) -> Result<ForfeitureReport, EngineError> {
		self.sweep_handler
			.expire_overdue_pos(now)
			.await
			.map_err(|e| EngineError::Handler(format!("Failed to forfeit pre-orders: {}", e)))
	}

	/// Runs until ctrl-c.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.run_until(async {
			tokio::signal::ctrl_c().await.ok();
		})
		.await
	}

	/// Main execution loop, returning once `shutdown` resolves.
	pub async fn run_until<S>(&self, shutdown: S) -> Result<(), EngineError>
	where
		S: Future<Output = ()>,
	{
		let mut event_receiver = self.event_bus.subscribe();

		if self.config.sweep.enabled {
			self.schedule_sweeps().await?;
			self.scheduler
				.start()
				.await
				.map_err(|e| EngineError::Service(e.to_string()))?;
		} else {
			tracing::info!("Sweeps disabled, expecting an external scheduler");
		}

		// Start storage cleanup task
		let storage = self.storage.clone();
		let cleanup_interval = tokio::time::interval(Duration::from_secs(
			self.config.storage.cleanup_interval_seconds,
		));
		let cleanup_handle = tokio::spawn(async move {
			let mut interval = cleanup_interval;
			loop {
				interval.tick().await;
				match storage.cleanup_expired().await {
					Ok(count) if count > 0 => {
						tracing::debug!("Storage cleanup: removed {} expired entries", count);
					},
					Err(e) => {
						tracing::warn!("Storage cleanup failed: {}", e);
					},
					_ => {},
				}
				let purged = storage.locks().purge_idle();
				if purged > 0 {
					tracing::debug!("Lock cleanup: purged {} idle locks", purged);
				}
			}
		});

		let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
		tokio::pin!(shutdown);

		loop {
			tokio::select! {
				received = event_receiver.recv() => {
					match received {
						Ok(event) => {
							if event.topic().is_none() || self.notifications.is_empty() {
								continue;
							}
							let occurred_at = self.clock.now();
							self.spawn_handler(&semaphore, move |engine| async move {
								engine.notifications.notify(&event, occurred_at).await;
								Ok(())
							})
							.await;
						},
						Err(RecvError::Lagged(skipped)) => {
							let total = self.lagged_events.fetch_add(skipped, Ordering::Relaxed) + skipped;
							tracing::error!(skipped, total, "Event loop lagged, notifications dropped");
						},
						Err(RecvError::Closed) => break,
					}
				}

				_ = &mut shutdown => {
					break;
				}
			}
		}

		cleanup_handle.abort();
		self.shutdown().await
	}

	async fn schedule_sweeps(&self) -> Result<(), EngineError> {
		let engine = self.clone();
		let reservations: Job = Arc::new(move || {
			let engine = engine.clone();
			Box::pin(async move {
				let now = engine.clock.now();
				engine
					.sweep_reservations(now)
					.await
					.map(|_| ())
					.map_err(|e| e.to_string())
			})
		});

		let engine = self.clone();
		let forfeitures: Job = Arc::new(move || {
			let engine = engine.clone();
			Box::pin(async move {
				let now = engine.clock.now();
				engine
					.forfeit_overdue(now)
					.await
					.map(|_| ())
					.map_err(|e| e.to_string())
			})
		});

		let sweep = &self.config.sweep;
		self.scheduler
			.register(
				"reservation-sweep",
				Duration::from_secs(sweep.reservation_interval_seconds),
				reservations,
			)
			.await
			.map_err(|e| EngineError::Config(e.to_string()))?;
		self.scheduler
			.register(
				"ghost-protocol",
				Duration::from_secs(sweep.forfeiture_interval_seconds),
				forfeitures,
			)
			.await
			.map_err(|e| EngineError::Config(e.to_string()))?;
		Ok(())
	}

	/// Events skipped by the notification loop since the engine was built.
	///
	/// Their notifications were never sent; the state they describe is
	/// committed regardless.
	pub fn lagged_events(&self) -> u64 {
		self.lagged_events.load(Ordering::Relaxed)
	}

	pub fn inventory(&self) -> &Arc<InventoryService> {
		&self.inventory
	}

	pub fn ledger(&self) -> &Arc<LedgerService> {
		&self.ledger
	}

	pub fn orders(&self) -> &Arc<OrderHandler> {
		&self.order_handler
	}

	/// Returns a reference to the event bus.
	pub fn event_bus(&self) -> &event_bus::EventBus {
		&self.event_bus
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	/// Helper method to spawn handler tasks with semaphore-based concurrency control.
	async fn spawn_handler<F, Fut>(&self, semaphore: &Arc<Semaphore>, handler: F)
	where
		F: FnOnce(CommerceEngine) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), EngineError>> + Send,
	{
		let engine = self.clone();
		match semaphore.clone().acquire_owned().await {
			Ok(permit) => {
				tokio::spawn(async move {
					let _permit = permit;
					if let Err(e) = handler(engine).await {
						tracing::error!("Handler error: {}", e);
					}
				});
			},
			Err(e) => {
				tracing::error!("Failed to acquire semaphore permit: {}", e);
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::builder::tests::{engine_with, start, CONFIG};
	use crate::notifications::{MockNotificationInterface, NotificationInterface, RetryPolicy};
	use chrono::Duration as ChronoDuration;
	use commerce_types::{OrderEvent, OrderStatus};
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn line(product_id: &str, quantity: u32, price: i64) -> OrderLine {
		OrderLine::new(product_id, quantity, Decimal::new(price, 0))
	}

	#[tokio::test]
	async fn test_trial_balance_holds_after_mixed_sequence() {
		let (engine, clock) = engine_with(CONFIG).await;
		engine.inventory().create_product("sku-1", "Booster Box", 10).await.unwrap();
		engine.inventory().create_product("sku-2", "Playmat", 10).await.unwrap();

		let paid = engine
			.create_order(vec![line("sku-1", 2, 50)], DepositPolicy::FullPayment)
			.await
			.unwrap();
		engine
			.confirm_payment(&paid.id, Decimal::new(100, 0), "pay-1")
			.await
			.unwrap();

		let refunded = engine
			.create_order(vec![line("sku-2", 1, 30)], DepositPolicy::FullPayment)
			.await
			.unwrap();
		engine
			.confirm_payment(&refunded.id, Decimal::new(30, 0), "pay-2")
			.await
			.unwrap();
		engine.cancel(&refunded.id, "changed mind").await.unwrap();

		let deadline = start() + ChronoDuration::days(7);
		let ghost = engine
			.create_order(
				vec![line("sku-1", 3, 100)],
				DepositPolicy::Deposit {
					amount: Decimal::new(60, 0),
					deadline,
				},
			)
			.await
			.unwrap();
		engine
			.confirm_payment(&ghost.id, Decimal::new(60, 0), "dep-1")
			.await
			.unwrap();
		engine
			.record_expense("Shipping labels", None, Decimal::new(12, 0), "exp-1")
			.await
			.unwrap();

		clock.set(deadline + ChronoDuration::milliseconds(1));
		let report = engine.forfeit_overdue(clock.now()).await.unwrap();
		assert_eq!(report.forfeited, 1);
		assert_eq!(engine.order(&ghost.id).await.unwrap().status, OrderStatus::Forfeited);

		let trial_balance = engine.ledger().trial_balance().await.unwrap();
		assert!(trial_balance.is_balanced());
		assert!(engine.ledger().verify().await.unwrap().is_empty());
		for entry in engine.ledger().entries().await.unwrap() {
			assert!(entry.is_balanced());
		}
	}

	#[tokio::test]
	async fn test_reservation_sweep_cancels_lapsed_checkouts() {
		let (engine, clock) = engine_with(CONFIG).await;
		engine.inventory().create_product("sku-1", "Booster Box", 4).await.unwrap();
		let order = engine
			.create_order(vec![line("sku-1", 3, 10)], DepositPolicy::FullPayment)
			.await
			.unwrap();
		// A bare hold outside any order.
		engine
			.inventory()
			.reserve("sku-1", 1, ChronoDuration::minutes(1), "cart-7")
			.await
			.unwrap();
		assert_eq!(engine.inventory().available_stock("sku-1").await.unwrap(), 0);

		clock.advance(ChronoDuration::minutes(16));
		let sweep = engine.sweep_reservations(clock.now()).await.unwrap();
		assert_eq!(
			sweep,
			ReservationSweep {
				cancelled_checkouts: 1,
				expired_reservations: 1,
			}
		);
		assert_eq!(engine.order(&order.id).await.unwrap().status, OrderStatus::Cancelled);
		assert_eq!(engine.inventory().available_stock("sku-1").await.unwrap(), 4);

		let again = engine.sweep_reservations(clock.now()).await.unwrap();
		assert_eq!(again, ReservationSweep::default());
	}

	#[tokio::test]
	async fn test_run_until_routes_events_to_notifications() {
		let (mut engine, _clock) = engine_with(CONFIG).await;
		let delivered = Arc::new(AtomicUsize::new(0));
		let counter = delivered.clone();
		let mut mock = MockNotificationInterface::new();
		mock.expect_accepts().returning(|topic| topic == "order.created");
		mock.expect_dispatch().returning(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});
		let dispatchers: Vec<(String, Box<dyn NotificationInterface>)> = vec![("mock".into(), Box::new(mock))];
		engine.notifications = Arc::new(NotificationService::new(dispatchers, RetryPolicy::default()));
		engine.inventory().create_product("sku-1", "Booster Box", 5).await.unwrap();

		let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
		let runner = engine.clone();
		let handle = tokio::spawn(async move {
			runner
				.run_until(async {
					stop_rx.await.ok();
				})
				.await
		});
		// Let the loop subscribe before publishing.
		while engine.event_bus().subscriber_count() == 0 {
			tokio::task::yield_now().await;
		}

		engine
			.create_order(vec![line("sku-1", 1, 10)], DepositPolicy::FullPayment)
			.await
			.unwrap();
		for _ in 0..100 {
			if delivered.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(delivered.load(Ordering::SeqCst), 1);

		stop_tx.send(()).unwrap();
		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_lagging_loop_counts_skipped_events() {
		let (mut engine, _clock) = engine_with(CONFIG).await;
		let delivered = Arc::new(AtomicUsize::new(0));
		let counter = delivered.clone();
		let mut mock = MockNotificationInterface::new();
		mock.expect_accepts().returning(|_| true);
		mock.expect_dispatch().returning(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});
		let dispatchers: Vec<(String, Box<dyn NotificationInterface>)> = vec![("mock".into(), Box::new(mock))];
		engine.notifications = Arc::new(NotificationService::new(dispatchers, RetryPolicy::default()));
		engine.event_bus = event_bus::EventBus::new(2);

		let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
		let runner = engine.clone();
		let handle = tokio::spawn(async move {
			runner
				.run_until(async {
					stop_rx.await.ok();
				})
				.await
		});
		while engine.event_bus().subscriber_count() == 0 {
			tokio::task::yield_now().await;
		}

		// Published without yielding, so the loop sees only the newest two.
		for i in 0..6 {
			engine
				.event_bus()
				.publish(CommerceEvent::Order(OrderEvent::Cancelled {
					order_id: format!("order-{}", i),
					reason: "test".into(),
				}))
				.unwrap();
		}
		for _ in 0..100 {
			if delivered.load(Ordering::SeqCst) == 2 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(delivered.load(Ordering::SeqCst), 2);
		assert_eq!(engine.lagged_events(), 4);

		stop_tx.send(()).unwrap();
		handle.await.unwrap().unwrap();
	}
}
