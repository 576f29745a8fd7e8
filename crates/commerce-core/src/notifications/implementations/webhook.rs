//! Dispatcher that POSTs notifications as JSON to an HTTP endpoint.

use crate::notifications::{
	implementations::log::topics_from, Notification, NotificationError, NotificationFactory,
	NotificationInterface, NotificationRegistry,
};
use async_trait::async_trait;
use commerce_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Webhook dispatcher.
///
/// Any transport failure or non-2xx response counts as a failed delivery and
/// is retried by the notification service.
pub struct WebhookNotifier {
	client: reqwest::Client,
	url: String,
	topics: Option<Vec<String>>,
}

impl WebhookNotifier {
	pub fn new(url: String, timeout: Duration, topics: Option<Vec<String>>) -> Result<Self, NotificationError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| NotificationError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
		Ok(Self { client, url, topics })
	}
}

#[async_trait]
impl NotificationInterface for WebhookNotifier {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(WebhookNotifierSchema)
	}

	fn accepts(&self, topic: &str) -> bool {
		self.topics
			.as_ref()
			.is_none_or(|topics| topics.iter().any(|t| t == topic))
	}

	async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
		let response = self
			.client
			.post(&self.url)
			.json(notification)
			.send()
			.await
			.map_err(|e| NotificationError::Delivery(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(NotificationError::Delivery(format!(
				"{} responded with {}",
				self.url, status
			)));
		}
		Ok(())
	}
}

/// Configuration schema for WebhookNotifier.
pub struct WebhookNotifierSchema;

impl ConfigSchema for WebhookNotifierSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("url", FieldType::String).with_validator(|value| {
				let url = value.as_str().unwrap_or_default();
				if url.starts_with("http://") || url.starts_with("https://") {
					Ok(())
				} else {
					Err("must be an http(s) URL".to_string())
				}
			})],
			vec![
				Field::new(
					"timeout_ms",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
				Field::new("topics", FieldType::Array(Box::new(FieldType::String))),
			],
		)
		.validate(config)
	}
}

/// Factory function to create a webhook dispatcher from configuration.
///
/// Configuration parameters:
/// - `url`: Endpoint receiving the JSON notifications
/// - `timeout_ms`: Request timeout (default: 5000)
/// - `topics`: Topics to forward (default: all)
pub fn create_notifier(config: &toml::Value) -> Result<Box<dyn NotificationInterface>, NotificationError> {
	WebhookNotifierSchema
		.validate(config)
		.map_err(|e| NotificationError::Configuration(e.to_string()))?;

	let url = config
		.get("url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| NotificationError::Configuration("url is required".into()))?
		.to_string();
	let timeout_ms = config
		.get("timeout_ms")
		.and_then(|v| v.as_integer())
		.map(|ms| ms as u64)
		.unwrap_or(DEFAULT_TIMEOUT_MS);

	Ok(Box::new(WebhookNotifier::new(
		url,
		Duration::from_millis(timeout_ms),
		topics_from(config),
	)?))
}

/// Registry for the webhook dispatcher.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "webhook";
	type Factory = NotificationFactory;

	fn factory() -> Self::Factory {
		create_notifier
	}
}

impl NotificationRegistry for Registry {}
