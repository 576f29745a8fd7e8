//! Configuration module for the commerce core.
//!
//! This module provides structures and utilities for managing the shop's
//! configuration. It supports loading configuration from TOML files and
//! validates that all required values are properly set before anything is
//! wired together.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files for better organization:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

mod loader;

use commerce_types::{default_chart, AccountSeed, MappingKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the commerce core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this shop instance.
	pub shop: ShopConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Stock reservation settings.
	#[serde(default)]
	pub inventory: InventoryConfig,
	/// Order lifecycle settings.
	#[serde(default)]
	pub orders: OrdersConfig,
	/// Background sweep intervals.
	#[serde(default)]
	pub sweep: SweepConfig,
	/// Chart of accounts seeded at startup.
	#[serde(default)]
	pub ledger: LedgerConfig,
	/// Outbound notification dispatch.
	#[serde(default)]
	pub notifications: NotificationConfig,
}

/// Configuration specific to the shop instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShopConfig {
	/// Unique identifier for this shop instance.
	pub id: String,
	/// ISO currency code all amounts are expressed in.
	#[serde(default = "default_currency")]
	pub currency: String,
}

fn default_currency() -> String {
	"USD".to_string()
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries and idle locks.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	3600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InventoryConfig {
	/// How long a standard checkout holds its stock.
	#[serde(default = "default_checkout_hold_seconds")]
	pub checkout_hold_seconds: u64,
	/// Availability at or below which `stock.low` is published.
	#[serde(default = "default_low_stock_threshold")]
	pub low_stock_threshold: u32,
}

fn default_checkout_hold_seconds() -> u64 {
	900 // 15 minutes
}

fn default_low_stock_threshold() -> u32 {
	5
}

impl Default for InventoryConfig {
	fn default() -> Self {
		Self {
			checkout_hold_seconds: default_checkout_hold_seconds(),
			low_stock_threshold: default_low_stock_threshold(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrdersConfig {
	/// Extra time a pre-order's reservations outlive its deposit deadline,
	/// leaving the forfeiture sweep to expire them.
	#[serde(default = "default_forfeiture_grace_seconds")]
	pub forfeiture_grace_seconds: u64,
}

fn default_forfeiture_grace_seconds() -> u64 {
	86400
}

impl Default for OrdersConfig {
	fn default() -> Self {
		Self {
			forfeiture_grace_seconds: default_forfeiture_grace_seconds(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweepConfig {
	/// Set to false when an external scheduler drives the sweeps.
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_reservation_interval_seconds")]
	pub reservation_interval_seconds: u64,
	#[serde(default = "default_forfeiture_interval_seconds")]
	pub forfeiture_interval_seconds: u64,
}

fn default_true() -> bool {
	true
}

fn default_reservation_interval_seconds() -> u64 {
	60
}

fn default_forfeiture_interval_seconds() -> u64 {
	86400
}

impl Default for SweepConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			reservation_interval_seconds: default_reservation_interval_seconds(),
			forfeiture_interval_seconds: default_forfeiture_interval_seconds(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
	#[serde(default = "default_chart")]
	pub accounts: Vec<AccountSeed>,
}

impl Default for LedgerConfig {
	fn default() -> Self {
		Self {
			accounts: default_chart(),
		}
	}
}

/// Configuration for notification dispatch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
	/// Map of dispatcher names to their configurations.
	#[serde(default)]
	pub implementations: HashMap<String, toml::Value>,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_initial_backoff_ms")]
	pub initial_backoff_ms: u64,
	#[serde(default = "default_max_backoff_ms")]
	pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
	3
}

fn default_initial_backoff_ms() -> u64 {
	500
}

fn default_max_backoff_ms() -> u64 {
	10_000
}

impl Default for NotificationConfig {
	fn default() -> Self {
		Self {
			implementations: HashMap::new(),
			max_retries: default_max_retries(),
			initial_backoff_ms: default_initial_backoff_ms(),
			max_backoff_ms: default_max_backoff_ms(),
		}
	}
}

/// Mapping keys the order lifecycle posts against.
const REQUIRED_MAPPINGS: [MappingKey; 4] = [
	MappingKey::PrimaryBank,
	MappingKey::CustomerDeposit,
	MappingKey::SalesRevenue,
	MappingKey::PoRevenue,
];

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = input.to_string();
	let mut replacements = Vec::new();

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let var_name = var_name.as_str();
		let default_value = cap.get(2).map(|m| m.as_str());

		let value = match std::env::var(var_name) {
			Ok(v) => v,
			Err(_) => match default_value {
				Some(default) => default.to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name
					)))
				},
			},
		};

		replacements.push((full_match.start(), full_match.end(), value));
	}

	// Apply replacements in reverse order to maintain positions
	for (start, end, value) in replacements.iter().rev() {
		result.replace_range(start..end, value);
	}

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	///
	/// Each top-level section must be unique across all configuration files.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates the configuration to ensure all required fields are properly set.
	///
	/// - shop id is not empty
	/// - the primary storage is among the configured implementations
	/// - intervals and hold times are positive
	/// - account codes and mapping keys are unique and the lifecycle's
	///   mapping keys are all present
	fn validate(&self) -> Result<(), ConfigError> {
		if self.shop.id.is_empty() {
			return Err(ConfigError::Validation("Shop ID cannot be empty".into()));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if self.storage.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Storage primary implementation cannot be empty".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.storage.cleanup_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		if self.inventory.checkout_hold_seconds == 0 {
			return Err(ConfigError::Validation(
				"Inventory checkout_hold_seconds must be greater than 0".into(),
			));
		}

		if self.sweep.reservation_interval_seconds == 0
			|| self.sweep.forfeiture_interval_seconds == 0
		{
			return Err(ConfigError::Validation(
				"Sweep intervals must be greater than 0".into(),
			));
		}

		self.validate_chart()?;

		if self.notifications.initial_backoff_ms > self.notifications.max_backoff_ms {
			return Err(ConfigError::Validation(
				"Notification initial_backoff_ms cannot exceed max_backoff_ms".into(),
			));
		}

		Ok(())
	}

	fn validate_chart(&self) -> Result<(), ConfigError> {
		let mut codes = HashSet::new();
		let mut mappings = HashSet::new();

		for account in &self.ledger.accounts {
			if account.code.is_empty() || account.name.is_empty() {
				return Err(ConfigError::Validation(
					"Ledger accounts need a code and a name".into(),
				));
			}
			if !codes.insert(account.code.as_str()) {
				return Err(ConfigError::Validation(format!(
					"Duplicate account code '{}'",
					account.code
				)));
			}
			if let Some(key) = account.mapping_key {
				if !mappings.insert(key) {
					return Err(ConfigError::Validation(format!(
						"Mapping key {} assigned to more than one account",
						key
					)));
				}
			}
		}

		for key in REQUIRED_MAPPINGS {
			if !mappings.contains(&key) {
				return Err(ConfigError::Validation(format!(
					"Chart of accounts has no account mapped to {}",
					key
				)));
			}
		}

		Ok(())
	}
}

/// Implementation of FromStr trait for Config to enable parsing from string.
///
/// Environment variables are resolved and the configuration is validated
/// after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use commerce_types::AccountType;

	const MINIMAL: &str = r#"
[shop]
id = "shop-1"

[storage]
primary = "memory"
[storage.implementations.memory]
"#;

	#[test]
	fn test_env_var_resolution() {
		std::env::set_var("COMMERCE_TEST_HOST", "localhost");
		std::env::set_var("COMMERCE_TEST_PORT", "5432");

		let input = "host = \"${COMMERCE_TEST_HOST}:${COMMERCE_TEST_PORT}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "host = \"localhost:5432\"");

		std::env::remove_var("COMMERCE_TEST_HOST");
		std::env::remove_var("COMMERCE_TEST_PORT");
	}

	#[test]
	fn test_env_var_with_default() {
		let input = "value = \"${COMMERCE_MISSING_VAR:-default_value}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "value = \"default_value\"");
	}

	#[test]
	fn test_missing_env_var_error() {
		let input = "value = \"${COMMERCE_MISSING_VAR}\"";
		let result = resolve_env_vars(input);
		assert!(result.is_err());
		assert!(result.unwrap_err().to_string().contains("COMMERCE_MISSING_VAR"));
	}

	#[test]
	fn test_minimal_config_uses_defaults() {
		let config: Config = MINIMAL.parse().unwrap();
		assert_eq!(config.shop.currency, "USD");
		assert_eq!(config.storage.cleanup_interval_seconds, 3600);
		assert_eq!(config.inventory.checkout_hold_seconds, 900);
		assert_eq!(config.orders.forfeiture_grace_seconds, 86400);
		assert_eq!(config.sweep.reservation_interval_seconds, 60);
		assert_eq!(config.sweep.forfeiture_interval_seconds, 86400);
		assert!(config.sweep.enabled);
		assert_eq!(config.ledger.accounts, default_chart());
		assert!(config.notifications.implementations.is_empty());
	}

	#[test]
	fn test_config_with_env_vars() {
		std::env::set_var("COMMERCE_TEST_SHOP_ID", "shop-from-env");
		let config_str = MINIMAL.replace("shop-1", "${COMMERCE_TEST_SHOP_ID}");
		let config: Config = config_str.parse().unwrap();
		assert_eq!(config.shop.id, "shop-from-env");
		std::env::remove_var("COMMERCE_TEST_SHOP_ID");
	}

	#[test]
	fn test_unknown_primary_storage_rejected() {
		let config_str = MINIMAL.replace("primary = \"memory\"", "primary = \"file\"");
		let err = config_str.parse::<Config>().unwrap_err();
		assert!(err.to_string().contains("Primary storage 'file'"));
	}

	#[test]
	fn test_custom_chart_is_parsed() {
		let config_str = format!(
			"{}\n{}",
			MINIMAL,
			r#"
[[ledger.accounts]]
code = "1002"
name = "Bank"
type = "ASSET"
mapping_key = "PRIMARY_BANK"

[[ledger.accounts]]
code = "2001"
name = "Deposits"
type = "LIABILITY"
mapping_key = "CUSTOMER_DEPOSIT"

[[ledger.accounts]]
code = "4001"
name = "Sales"
type = "REVENUE"
mapping_key = "SALES_REVENUE"

[[ledger.accounts]]
code = "4002"
name = "PO Sales"
type = "REVENUE"
mapping_key = "PO_REVENUE"

[[ledger.accounts]]
code = "6100"
name = "Shipping"
type = "EXPENSE"
"#
		);
		let config: Config = config_str.parse().unwrap();
		assert_eq!(config.ledger.accounts.len(), 5);
		assert_eq!(config.ledger.accounts[4].account_type, AccountType::Expense);
		assert_eq!(config.ledger.accounts[4].mapping_key, None);
	}

	#[test]
	fn test_chart_without_required_mapping_rejected() {
		let config_str = format!(
			"{}\n{}",
			MINIMAL,
			r#"
[[ledger.accounts]]
code = "1002"
name = "Bank"
type = "ASSET"
mapping_key = "PRIMARY_BANK"
"#
		);
		let err = config_str.parse::<Config>().unwrap_err();
		assert!(err.to_string().contains("CUSTOMER_DEPOSIT"));
	}

	#[test]
	fn test_duplicate_account_code_rejected() {
		let config_str = format!(
			"{}\n{}",
			MINIMAL,
			r#"
[[ledger.accounts]]
code = "1002"
name = "Bank"
type = "ASSET"
mapping_key = "PRIMARY_BANK"

[[ledger.accounts]]
code = "1002"
name = "Other bank"
type = "ASSET"
"#
		);
		let err = config_str.parse::<Config>().unwrap_err();
		assert!(err.to_string().contains("Duplicate account code '1002'"));
	}

	#[test]
	fn test_zero_sweep_interval_rejected() {
		let config_str = format!("{}\n[sweep]\nreservation_interval_seconds = 0\n", MINIMAL);
		assert!(config_str.parse::<Config>().is_err());
	}
}
