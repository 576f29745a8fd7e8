//! Builder pattern for constructing commerce engines.
//!
//! Composes a CommerceEngine from configuration and factory functions for
//! the pluggable parts: the storage backend and the notification
//! dispatchers. The chart of accounts from the configuration is seeded while
//! building, so an engine never runs without the accounts it posts to.

use crate::engine::{
	event_bus::EventBus, CommerceEngine, EVENTS_PER_DELIVERY_SLOT, MAX_CONCURRENT_DELIVERIES,
};
use crate::notifications::{NotificationError, NotificationInterface, NotificationService, RetryPolicy};
use commerce_config::Config;
use commerce_inventory::InventoryService;
use commerce_ledger::LedgerService;
use commerce_storage::{StorageError, StorageInterface, StorageService};
use commerce_types::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Capacity of the event bus, per subscriber.
const EVENT_BUS_CAPACITY: usize = MAX_CONCURRENT_DELIVERIES * EVENTS_PER_DELIVERY_SLOT;

/// Errors that can occur during commerce engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Container for all factory functions needed to build a CommerceEngine.
///
/// Each factory takes the TOML table configured for its implementation name
/// and returns the corresponding implementation.
pub struct CommerceFactories<SF, NF> {
	pub storage_factories: HashMap<String, SF>,
	pub notification_factories: HashMap<String, NF>,
}

/// Builder for constructing a CommerceEngine with pluggable implementations.
pub struct CommerceBuilder {
	config: Config,
	clock: Arc<dyn Clock>,
}

impl CommerceBuilder {
	/// Creates a new CommerceBuilder with the given configuration.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			clock: Arc::new(SystemClock),
		}
	}

	/// Replaces the wall clock, mainly for tests.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Builds the CommerceEngine using factories for each component type.
	pub async fn build<SF, NF>(self, factories: CommerceFactories<SF, NF>) -> Result<CommerceEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		NF: Fn(&toml::Value) -> Result<Box<dyn NotificationInterface>, NotificationError>,
	{
		// Create storage implementations
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			if let Some(factory) = factories.storage_factories.get(name) {
				match factory(config) {
					Ok(implementation) => {
						storage_impls.insert(name.clone(), implementation);
						let is_primary = &self.config.storage.primary == name;
						tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Failed to create storage implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create storage implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}

		if storage_impls.is_empty() {
			return Err(BuilderError::Config(
				"No valid storage implementations available".into(),
			));
		}

		// Get the primary storage implementation
		let primary_storage = &self.config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::Config(format!(
				"Primary storage '{}' failed to load or has invalid configuration",
				primary_storage
			))
		})?;

		let storage = Arc::new(StorageService::new(storage_backend));

		// Create notification dispatchers
		let mut dispatchers: Vec<(String, Box<dyn NotificationInterface>)> = Vec::new();
		for (name, config) in &self.config.notifications.implementations {
			let Some(factory) = factories.notification_factories.get(name) else {
				return Err(BuilderError::MissingComponent(format!(
					"Unknown notification implementation '{}'",
					name
				)));
			};
			match factory(config) {
				Ok(implementation) => {
					tracing::info!(component = "notifications", implementation = %name, enabled = true, "Loaded");
					dispatchers.push((name.clone(), implementation));
				},
				Err(e) => {
					tracing::error!(
						component = "notifications",
						implementation = %name,
						error = %e,
						"Failed to create notification implementation"
					);
					return Err(BuilderError::Config(format!(
						"Failed to create notification implementation '{}': {}",
						name, e
					)));
				},
			}
		}
		dispatchers.sort_by(|a, b| a.0.cmp(&b.0));
		let notifications = NotificationService::new(
			dispatchers,
			RetryPolicy::from_config(&self.config.notifications),
		);

		let inventory = Arc::new(InventoryService::new(storage.clone(), self.clock.clone()));
		let ledger = Arc::new(LedgerService::new(storage.clone(), self.clock.clone()));

		let opened = ledger
			.seed_chart(&self.config.ledger.accounts)
			.await
			.map_err(|e| BuilderError::Config(format!("Failed to seed chart of accounts: {}", e)))?;
		tracing::info!(
			component = "ledger",
			accounts = self.config.ledger.accounts.len(),
			opened,
			"Chart of accounts ready"
		);

		let event_bus = EventBus::new(EVENT_BUS_CAPACITY);

		Ok(CommerceEngine::new(
			self.config,
			storage,
			inventory,
			ledger,
			event_bus,
			notifications,
			self.clock,
		))
	}
}
