//! Broadcast bus for committed commerce events.
//!
//! Handlers publish after their transaction commits; the engine loop and the
//! notification service each hold their own subscription. A slow subscriber
//! lags and drops the oldest events rather than blocking publishers.

use commerce_types::CommerceEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<CommerceEvent>,
}

impl EventBus {
	/// Creates a bus that buffers up to `capacity` events per subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CommerceEvent> {
		self.sender.subscribe()
	}

	/// Sends an event to every current subscriber.
	///
	/// Fails only when nobody is subscribed, which publishers ignore.
	pub fn publish(
		&self,
		event: CommerceEvent,
	) -> Result<usize, broadcast::error::SendError<CommerceEvent>> {
		tracing::trace!(topic = ?event.topic(), "Publishing event");
		self.sender.send(event)
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}
