#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use waypoint_domain::LocationTopic;

use super::{Acker, Broker, BrokerError, Delivery, DeliveryStream, QueueBinding};

/// In-process topic exchange for tests and `memory://` development runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
	state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
	queues: HashMap<String, MemoryQueue>,
	acked: HashMap<String, u64>,
	published: u64,
	fail_subscriptions: bool,
	closed: bool,
}

#[derive(Debug)]
struct MemoryQueue {
	binding: QueueBinding,
	tx: mpsc::UnboundedSender<Delivery>,
}

struct MemoryAcker {
	state: Arc<Mutex<State>>,
	queue: String,
}

#[async_trait]
impl Acker for MemoryAcker {
	async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
		*self.state.lock().acked.entry(self.queue.clone()).or_default() += 1;
		Ok(())
	}
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make subsequent `subscribe` calls fail (simulates a broker outage).
	pub fn fail_subscriptions(&self, fail: bool) {
		self.state.lock().fail_subscriptions = fail;
	}

	pub fn queue_names(&self) -> Vec<String> {
		let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
		names.sort();
		names
	}

	pub fn bindings(&self) -> Vec<QueueBinding> {
		let mut bindings: Vec<_> = self.state.lock().queues.values().map(|q| q.binding.clone()).collect();
		bindings.sort_by(|a, b| a.queue.cmp(&b.queue));
		bindings
	}

	pub fn has_queue(&self, queue: &str) -> bool {
		self.state.lock().queues.contains_key(queue)
	}

	pub fn acked(&self, queue: &str) -> u64 {
		self.state.lock().acked.get(queue).copied().unwrap_or(0)
	}

	pub fn total_acked(&self) -> u64 {
		self.state.lock().acked.values().sum()
	}

	pub fn published(&self) -> u64 {
		self.state.lock().published
	}
}

#[async_trait]
impl Broker for MemoryBroker {
	async fn subscribe(&self, binding: &QueueBinding) -> Result<DeliveryStream, BrokerError> {
		let (tx, rx) = mpsc::unbounded_channel::<Delivery>();

		{
			let mut state = self.state.lock();
			if state.closed {
				return Err(BrokerError::Closed);
			}
			if state.fail_subscriptions {
				return Err(BrokerError::Setup {
					queue: binding.queue.clone(),
					reason: "subscriptions disabled".to_string(),
				});
			}
			if state.queues.contains_key(&binding.queue) {
				return Err(BrokerError::QueueInUse(binding.queue.clone()));
			}
			state.queues.insert(
				binding.queue.clone(),
				MemoryQueue {
					binding: binding.clone(),
					tx,
				},
			);
		}

		debug!(queue = %binding.queue, pattern = %binding.pattern, "memory broker: queue bound");

		let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|d| (Ok(d), rx)) });
		Ok(stream.boxed())
	}

	async fn unsubscribe(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
		if self.state.lock().queues.remove(&binding.queue).is_some() {
			debug!(queue = %binding.queue, "memory broker: queue deleted");
		}
		Ok(())
	}

	async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError> {
		let mut state = self.state.lock();
		if state.closed {
			return Err(BrokerError::Closed);
		}
		state.published += 1;

		for queue in state.queues.values() {
			if queue.binding.exchange != exchange || !LocationTopic::pattern_matches(&queue.binding.pattern, routing_key) {
				continue;
			}

			let delivery = Delivery::new(
				routing_key,
				payload.clone(),
				Box::new(MemoryAcker {
					state: Arc::clone(&self.state),
					queue: queue.binding.queue.clone(),
				}),
			);
			let _ = queue.tx.send(delivery);
		}

		Ok(())
	}

	async fn close(&self) {
		let mut state = self.state.lock();
		state.closed = true;
		state.queues.clear();
	}

	fn is_connected(&self) -> bool {
		!self.state.lock().closed
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;

	use super::*;

	fn binding(queue: &str, pattern: &str) -> QueueBinding {
		QueueBinding {
			queue: queue.to_string(),
			exchange: "websocket.exchange".to_string(),
			pattern: pattern.to_string(),
		}
	}

	#[tokio::test]
	async fn publish_routes_by_topic_pattern() {
		let broker = MemoryBroker::new();
		let mut a = broker.subscribe(&binding("location.alice.phoneA", "location.alice.*")).await.unwrap();
		let mut b = broker.subscribe(&binding("location.bob.phone", "location.bob.*")).await.unwrap();

		broker
			.publish("websocket.exchange", "location.alice.*", Bytes::from_static(b"hi"))
			.await
			.unwrap();

		let d = timeout(Duration::from_millis(200), a.next()).await.unwrap().unwrap().unwrap();
		assert_eq!(d.payload, Bytes::from_static(b"hi"));
		assert_eq!(d.routing_key, "location.alice.*");
		d.ack().await.unwrap();
		assert_eq!(broker.acked("location.alice.phoneA"), 1);

		assert!(timeout(Duration::from_millis(50), b.next()).await.is_err());
	}

	#[tokio::test]
	async fn other_exchanges_are_ignored() {
		let broker = MemoryBroker::new();
		let mut a = broker.subscribe(&binding("location.alice.phoneA", "location.alice.*")).await.unwrap();
		broker
			.publish("other.exchange", "location.alice.phoneA", Bytes::from_static(b"x"))
			.await
			.unwrap();
		assert!(timeout(Duration::from_millis(50), a.next()).await.is_err());
	}

	#[tokio::test]
	async fn exclusive_queue_cannot_be_declared_twice() {
		let broker = MemoryBroker::new();
		let b = binding("location.alice.phoneA", "location.alice.*");
		let _s = broker.subscribe(&b).await.unwrap();
		assert_eq!(
			broker.subscribe(&b).await.err(),
			Some(BrokerError::QueueInUse("location.alice.phoneA".to_string()))
		);
	}

	#[tokio::test]
	async fn unsubscribe_is_idempotent_and_ends_stream() {
		let broker = MemoryBroker::new();
		let b = binding("location.alice.phoneA", "location.alice.*");
		let mut s = broker.subscribe(&b).await.unwrap();
		broker.unsubscribe(&b).await.unwrap();
		broker.unsubscribe(&b).await.unwrap();
		assert!(!broker.has_queue(&b.queue));
		assert!(s.next().await.is_none());
	}

	#[tokio::test]
	async fn failing_and_closed_broker_reject_subscriptions() {
		let broker = MemoryBroker::new();
		broker.fail_subscriptions(true);
		assert!(matches!(
			broker.subscribe(&binding("q", "p")).await,
			Err(BrokerError::Setup { .. })
		));

		broker.fail_subscriptions(false);
		broker.close().await;
		assert!(!broker.is_connected());
		assert!(matches!(broker.subscribe(&binding("q", "p")).await, Err(BrokerError::Closed)));
	}
}
