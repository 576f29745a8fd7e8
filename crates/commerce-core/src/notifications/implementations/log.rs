//! Dispatcher that writes notifications to the tracing log.

use crate::notifications::{
	Notification, NotificationError, NotificationFactory, NotificationInterface, NotificationRegistry,
};
use async_trait::async_trait;
use commerce_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};

/// Logs every accepted notification at info level.
pub struct LogNotifier {
	topics: Option<Vec<String>>,
}

impl LogNotifier {
	pub fn new(topics: Option<Vec<String>>) -> Self {
		Self { topics }
	}
}

#[async_trait]
impl NotificationInterface for LogNotifier {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LogNotifierSchema)
	}

	fn accepts(&self, topic: &str) -> bool {
		self.topics
			.as_ref()
			.is_none_or(|topics| topics.iter().any(|t| t == topic))
	}

	async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
		tracing::info!(
			topic = %notification.topic,
			occurred_at = %notification.occurred_at,
			payload = %notification.payload,
			"Notification"
		);
		Ok(())
	}
}

/// Configuration schema for LogNotifier.
pub struct LogNotifierSchema;

impl ConfigSchema for LogNotifierSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![Field::new("topics", FieldType::Array(Box::new(FieldType::String)))],
		)
		.validate(config)
	}
}

/// Reads the optional `topics` filter shared by the dispatchers.
pub(crate) fn topics_from(config: &toml::Value) -> Option<Vec<String>> {
	config.get("topics").and_then(|v| v.as_array()).map(|topics| {
		topics
			.iter()
			.filter_map(|t| t.as_str().map(str::to_string))
			.collect()
	})
}

/// Factory function to create a log dispatcher from configuration.
///
/// Configuration parameters:
/// - `topics`: Topics to log (default: all)
pub fn create_notifier(config: &toml::Value) -> Result<Box<dyn NotificationInterface>, NotificationError> {
	LogNotifierSchema
		.validate(config)
		.map_err(|e| NotificationError::Configuration(e.to_string()))?;

	Ok(Box::new(LogNotifier::new(topics_from(config))))
}

/// Registry for the log dispatcher.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "log";
	type Factory = NotificationFactory;

	fn factory() -> Self::Factory {
		create_notifier
	}
}

impl NotificationRegistry for Registry {}
