//! Lifecycle management for the commerce engine.
//!
//! Startup reconciles persisted state before any request is served; shutdown
//! stops the sweeps and waits for runs already in flight.

use super::{CommerceEngine, EngineError};
use crate::recovery::{RecoveryReport, RecoveryService};

impl CommerceEngine {
	/// Reconciles stock counters, balances and order reservations.
	pub async fn initialize(&self) -> Result<RecoveryReport, EngineError> {
		tracing::info!(shop = %self.config.shop.id, "Initializing commerce engine");

		let recovery = RecoveryService::new(self.storage.clone(), self.inventory.clone(), self.ledger.clone());
		let report = recovery
			.recover()
			.await
			.map_err(|e| EngineError::Service(format!("Recovery failed: {}", e)))?;

		if !report.is_clean() {
			tracing::warn!(
				inconsistent_orders = report.inconsistent_orders.len(),
				balance_drifts = report.balance_drifts,
				"Persisted state needs attention"
			);
		}
		Ok(report)
	}

	/// Performs cleanup operations
	pub async fn shutdown(&self) -> Result<(), EngineError> {
		tracing::info!("Shutting down commerce engine");
		self.scheduler.stop().await;
		Ok(())
	}
}
