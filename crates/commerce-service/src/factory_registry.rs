//! Dynamic factory registry for commerce implementations.
//!
//! Collects the factory functions of every storage backend and notification
//! dispatcher once, and selects the ones named in the configuration when an
//! engine is built.

use commerce_config::Config;
use commerce_core::notifications::{self, NotificationFactory};
use commerce_core::{CommerceBuilder, CommerceEngine, CommerceFactories};
use commerce_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Global registry for all implementation factories
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub notifications: HashMap<String, NotificationFactory>,
}

impl FactoryRegistry {
	/// Create a new empty registry
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			notifications: HashMap::new(),
		}
	}

	/// Register a storage implementation
	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	/// Register a notification dispatcher
	pub fn register_notification(&mut self, name: impl Into<String>, factory: NotificationFactory) {
		self.notifications.insert(name.into(), factory);
	}
}

// Global registry instance
static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Get the global factory registry, populating it on first use.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in commerce_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in notifications::get_all_implementations() {
			tracing::debug!("Registering notification implementation: {}", name);
			registry.register_notification(name, factory);
		}

		registry
	})
}

/// Macro to build factories from config implementations
macro_rules! build_factories {
	($registry:expr, $config_impls:expr, $registry_field:ident, $type_name:literal) => {{
		let mut factories = HashMap::new();
		for name in $config_impls.keys() {
			if let Some(factory) = $registry.$registry_field.get(name) {
				factories.insert(name.clone(), *factory);
			} else {
				let mut available: Vec<_> = $registry.$registry_field.keys().cloned().collect();
				available.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					$type_name,
					name,
					available.join(", ")
				)
				.into());
			}
		}
		factories
	}};
}

/// Build the engine using the registry and config
pub async fn build_engine_from_config(config: Config) -> Result<CommerceEngine, Box<dyn std::error::Error>> {
	let registry = get_registry();

	let storage_factories = build_factories!(registry, config.storage.implementations, storage, "storage");
	let notification_factories = build_factories!(
		registry,
		config.notifications.implementations,
		notifications,
		"notification"
	);

	let factories = CommerceFactories {
		storage_factories,
		notification_factories,
	};

	Ok(CommerceBuilder::new(config).build(factories).await?)
}

#[cfg(test)]
mod tests {
	use super::*;

	const CONFIG: &str = r#"
[shop]
id = "registry-test"

[storage]
primary = "memory"

[storage.implementations.memory]

[notifications.implementations.log]
topics = ["order.forfeited"]
"#;

	#[test]
	fn test_registry_knows_every_implementation() {
		let registry = get_registry();
		for name in ["memory", "file"] {
			assert!(registry.storage.contains_key(name));
		}
		for name in ["log", "webhook"] {
			assert!(registry.notifications.contains_key(name));
		}
	}

	#[tokio::test]
	async fn test_build_from_config() {
		let config: Config = CONFIG.parse().unwrap();
		let engine = build_engine_from_config(config).await.unwrap();
		assert_eq!(engine.config().shop.id, "registry-test");
	}

	#[tokio::test]
	async fn test_unknown_storage_is_rejected() {
		let config: Config = CONFIG
			.replace("primary = \"memory\"", "primary = \"redis\"")
			.replace("[storage.implementations.memory]", "[storage.implementations.redis]")
			.parse()
			.unwrap();
		let err = build_engine_from_config(config).await.err().unwrap();
		assert!(err.to_string().contains("Unknown storage implementation 'redis'"));
	}
}
