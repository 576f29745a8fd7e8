//! Outbound notifications for committed commerce events.
//!
//! Events that leave the core (`order.created`, `payment.confirmed`,
//! `order.cancelled`, `order.forfeited`, `stock.low`) are turned into
//! [`Notification`]s and handed to every configured dispatcher. A failed
//! delivery is retried with exponential backoff; it never touches the state
//! that produced the event.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use commerce_config::NotificationConfig;
use commerce_types::{CommerceEvent, ConfigSchema, ImplementationRegistry};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod log;
	pub mod webhook;
}

/// Errors that can occur while dispatching notifications.
#[derive(Debug, Error)]
pub enum NotificationError {
	/// The receiving end could not be reached or refused the notification.
	#[error("Delivery failed: {0}")]
	Delivery(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error("Serialization error: {0}")]
	Serialization(String),
}

/// A committed event on its way out of the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
	pub topic: String,
	pub occurred_at: DateTime<Utc>,
	/// The event itself, as JSON.
	pub payload: serde_json::Value,
}

impl Notification {
	/// Builds the notification for an event, or `None` for internal events.
	pub fn from_event(
		event: &CommerceEvent,
		occurred_at: DateTime<Utc>,
	) -> Result<Option<Self>, NotificationError> {
		let Some(topic) = event.topic() else {
			return Ok(None);
		};
		let payload = serde_json::to_value(event)
			.map_err(|e| NotificationError::Serialization(e.to_string()))?;
		Ok(Some(Self {
			topic: topic.to_string(),
			occurred_at,
			payload,
		}))
	}
}

/// Trait defining the interface for notification dispatchers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationInterface: Send + Sync {
	/// Returns the configuration schema for this dispatcher.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Whether this dispatcher wants notifications for `topic`.
	fn accepts(&self, _topic: &str) -> bool {
		true
	}

	/// Delivers one notification.
	async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Type alias for notification factory functions.
pub type NotificationFactory = fn(&toml::Value) -> Result<Box<dyn NotificationInterface>, NotificationError>;

/// Registry trait for notification implementations.
pub trait NotificationRegistry: ImplementationRegistry<Factory = NotificationFactory> {}

/// Get all registered notification implementations.
pub fn get_all_implementations() -> Vec<(&'static str, NotificationFactory)> {
	use implementations::{log, webhook};

	vec![
		(log::Registry::NAME, log::Registry::factory()),
		(webhook::Registry::NAME, webhook::Registry::factory()),
	]
}

/// Retry policy for deliveries.
///
/// Retries cover a dispatcher that fails. Delivery is still at most once: an
/// event the engine loop skips after lagging behind the bus is never
/// notified, and the loop reports it through `CommerceEngine::lagged_events`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Attempts after the first one.
	pub max_retries: u32,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
}

impl RetryPolicy {
	pub fn from_config(config: &NotificationConfig) -> Self {
		Self {
			max_retries: config.max_retries,
			initial_backoff: Duration::from_millis(config.initial_backoff_ms),
			max_backoff: Duration::from_millis(config.max_backoff_ms),
		}
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(10),
		}
	}
}

/// Fans notifications out to the configured dispatchers.
pub struct NotificationService {
	dispatchers: Vec<(String, Box<dyn NotificationInterface>)>,
	retry: RetryPolicy,
}

impl NotificationService {
	pub fn new(dispatchers: Vec<(String, Box<dyn NotificationInterface>)>, retry: RetryPolicy) -> Self {
		Self { dispatchers, retry }
	}

	pub fn is_empty(&self) -> bool {
		self.dispatchers.is_empty()
	}

	/// Sends the notification for `event` to every interested dispatcher.
	///
	/// Returns how many dispatchers received it. Dispatchers that still fail
	/// after all retries are logged and skipped.
	pub async fn notify(&self, event: &CommerceEvent, occurred_at: DateTime<Utc>) -> usize {
		let notification = match Notification::from_event(event, occurred_at) {
			Ok(Some(notification)) => notification,
			Ok(None) => return 0,
			Err(e) => {
				tracing::error!(error = %e, "Failed to build notification");
				return 0;
			},
		};

		let deliveries = self
			.dispatchers
			.iter()
			.filter(|(_, dispatcher)| dispatcher.accepts(&notification.topic))
			.map(|(name, dispatcher)| self.deliver(name, dispatcher.as_ref(), &notification));

		futures::future::join_all(deliveries)
			.await
			.into_iter()
			.filter(|delivered| *delivered)
			.count()
	}

	async fn deliver(
		&self,
		name: &str,
		dispatcher: &dyn NotificationInterface,
		notification: &Notification,
	) -> bool {
		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.retry.initial_backoff)
			.with_max_interval(self.retry.max_backoff)
			.with_max_elapsed_time(None)
			.build();
		let attempts = AtomicU32::new(0);
		let attempts = &attempts;
		let max_retries = self.retry.max_retries;

		let result = backoff::future::retry(policy, move || async move {
			let attempt = attempts.fetch_add(1, Ordering::SeqCst);
			dispatcher.dispatch(notification).await.map_err(|e| {
				if attempt >= max_retries {
					backoff::Error::permanent(e)
				} else {
					tracing::warn!(
						dispatcher = %name,
						topic = %notification.topic,
						attempt = attempt + 1,
						error = %e,
						"Notification delivery failed, retrying"
					);
					backoff::Error::transient(e)
				}
			})
		})
		.await;

		match result {
			Ok(()) => {
				tracing::debug!(dispatcher = %name, topic = %notification.topic, "Notification delivered");
				true
			},
			Err(e) => {
				tracing::error!(
					dispatcher = %name,
					topic = %notification.topic,
					attempts = attempts.load(Ordering::SeqCst),
					error = %e,
					"Notification dropped after retries"
				);
				false
			},
		}
	}
}
