#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt as _;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use waypoint_domain::TopicIdentity;

use crate::server::broker::{Broker, BrokerError, Delivery, DeliveryStream, QueueBinding};
use crate::server::registry::{CloseReason, ConnectionRegistry};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
	/// Handed to the live connection.
	Forwarded,
	/// The connection was registered but is gone or its buffer is full.
	Dropped,
	/// Nobody is registered for the identity.
	NoConnection,
}

struct ActiveConsumer {
	binding: QueueBinding,
	task: JoinHandle<()>,
}

/// Owns one exclusive queue and consumer task per bound identity.
pub struct BrokerBridge {
	broker: Arc<dyn Broker>,
	registry: ConnectionRegistry,
	exchange: String,
	consumers: Mutex<HashMap<TopicIdentity, ActiveConsumer>>,
}

impl BrokerBridge {
	pub fn new(broker: Arc<dyn Broker>, registry: ConnectionRegistry, exchange: impl Into<String>) -> Self {
		Self {
			broker,
			registry,
			exchange: exchange.into(),
			consumers: Mutex::new(HashMap::new()),
		}
	}

	pub fn broker(&self) -> &Arc<dyn Broker> {
		&self.broker
	}

	pub fn exchange(&self) -> &str {
		&self.exchange
	}

	pub fn binding_for(&self, identity: &TopicIdentity, pattern: &str) -> QueueBinding {
		QueueBinding {
			queue: identity.as_str().to_string(),
			exchange: self.exchange.clone(),
			pattern: pattern.to_string(),
		}
	}

	/// Declare, bind and start relaying the identity's queue.
	///
	/// Callers hold the identity lock and have already registered the
	/// connection that owns the queue.
	pub async fn open_for_identity(&self, identity: &TopicIdentity, pattern: &str) -> Result<(), BrokerError> {
		if self.has_consumer(identity) {
			self.close_for_identity(identity).await;
		}

		let binding = self.binding_for(identity, pattern);
		let stream = self.broker.subscribe(&binding).await?;

		let owner = self.registry.get(identity).map(|handle| handle.conn_id());
		let task = tokio::spawn(relay_deliveries(identity.clone(), owner, stream, self.registry.clone()));
		self.consumers
			.lock()
			.insert(identity.clone(), ActiveConsumer { binding, task });

		metrics::gauge!("waypoint_broker_consumers").increment(1.0);
		debug!(identity = %identity, pattern, "bridge: consumer started");
		Ok(())
	}

	/// Stop the consumer and delete the queue. Returns `false` if nothing was open.
	pub async fn close_for_identity(&self, identity: &TopicIdentity) -> bool {
		let removed = self.consumers.lock().remove(identity);
		let Some(consumer) = removed else {
			return false;
		};

		consumer.task.abort();
		if let Err(e) = self.broker.unsubscribe(&consumer.binding).await {
			debug!(identity = %identity, error = %e, "bridge: queue teardown failed (ignored)");
		}

		metrics::gauge!("waypoint_broker_consumers").decrement(1.0);
		debug!(identity = %identity, "bridge: consumer stopped");
		true
	}

	pub fn has_consumer(&self, identity: &TopicIdentity) -> bool {
		self.consumers.lock().contains_key(identity)
	}

	pub fn consumer_count(&self) -> usize {
		self.consumers.lock().len()
	}

	/// Tear down every queue (shutdown path).
	pub async fn close_all(&self) {
		let identities: Vec<_> = self.consumers.lock().keys().cloned().collect();
		for identity in identities {
			self.close_for_identity(&identity).await;
		}
	}
}

async fn relay_deliveries(
	identity: TopicIdentity,
	owner: Option<u64>,
	mut stream: DeliveryStream,
	registry: ConnectionRegistry,
) {
	while let Some(item) = stream.next().await {
		match item {
			Ok(delivery) => {
				forward_delivery(&registry, &identity, delivery).await;
			}
			Err(e) => {
				metrics::counter!("waypoint_broker_consumer_errors_total").increment(1);
				warn!(identity = %identity, error = %e, "bridge: consumer error");
			}
		}
	}

	// Deliberate closes abort this task, so an ended stream means the broker
	// dropped the subscription.
	metrics::counter!("waypoint_broker_subscriptions_lost_total").increment(1);
	match registry.get(&identity) {
		Some(handle) if Some(handle.conn_id()) == owner => {
			warn!(identity = %identity, conn_id = handle.conn_id(), "bridge: consumer stream ended, closing connection");
			handle.close(CloseReason::SubscriptionLost);
		}
		_ => debug!(identity = %identity, "bridge: consumer stream ended"),
	}
}

/// Relay one delivery to whoever is registered for `identity`, then ack it.
///
/// The ack happens exactly once whether or not anything was forwarded.
pub async fn forward_delivery(
	registry: &ConnectionRegistry,
	identity: &TopicIdentity,
	delivery: Delivery,
) -> ForwardOutcome {
	let outcome = match registry.get(identity) {
		Some(handle) => match handle.forward(delivery.payload.clone()) {
			Ok(()) => ForwardOutcome::Forwarded,
			Err(e) => {
				warn!(identity = %identity, error = %e, "bridge: forward failed");
				ForwardOutcome::Dropped
			}
		},
		None => ForwardOutcome::NoConnection,
	};

	match outcome {
		ForwardOutcome::Forwarded => metrics::counter!("waypoint_deliveries_forwarded_total").increment(1),
		ForwardOutcome::Dropped | ForwardOutcome::NoConnection => {
			metrics::counter!("waypoint_deliveries_dropped_total").increment(1)
		}
	}

	match delivery.ack().await {
		Ok(()) => metrics::counter!("waypoint_deliveries_acked_total").increment(1),
		Err(e) => warn!(identity = %identity, error = %e, "bridge: ack failed"),
	}

	outcome
}
