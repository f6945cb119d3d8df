#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, timeout};
use waypoint_domain::{LocationTopic, Principal, TopicIdentity, WEBSOCKET_EXCHANGE};

use crate::server::bridge::{BrokerBridge, ForwardOutcome, forward_delivery};
use crate::server::broker::{Acker, Broker, BrokerError, Delivery, MemoryBroker};
use crate::server::registry::{CloseReason, ConnectionHandle, ConnectionRecord, ConnectionRegistry, Liveness, Outbound, Outbox};

struct CountingAcker(Arc<AtomicUsize>);

#[async_trait]
impl Acker for CountingAcker {
	async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
		self.0.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

fn delivery(payload: &'static [u8], acks: &Arc<AtomicUsize>) -> Delivery {
	Delivery::new(
		"location.alice.*",
		Bytes::from_static(payload),
		Box::new(CountingAcker(Arc::clone(acks))),
	)
}

fn alice() -> (Principal, TopicIdentity, String) {
	let p = Principal::new("alice", "phoneA").expect("valid principal");
	let id = LocationTopic::queue_name(&p);
	let pattern = LocationTopic::routing_pattern(&p);
	(p, id, pattern)
}

fn register(registry: &ConnectionRegistry, identity: &TopicIdentity, conn_id: u64) -> Outbox {
	let (handle, rx) = ConnectionHandle::channel(conn_id);
	registry.register(identity.clone(), ConnectionRecord::new(handle, Arc::new(Liveness::default())));
	rx
}

async fn wait_for_acks(broker: &MemoryBroker, queue: &str, n: u64) {
	timeout(Duration::from_secs(1), async {
		while broker.acked(queue) < n {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("acks within timeout");
}

#[tokio::test]
async fn forward_delivers_payload_and_acks_once() {
	let registry = ConnectionRegistry::new();
	let (_, id, _) = alice();
	let mut rx = register(&registry, &id, 1);
	let acks = Arc::new(AtomicUsize::new(0));

	let outcome = forward_delivery(&registry, &id, delivery(b"{\"lat\":1}", &acks)).await;

	assert_eq!(outcome, ForwardOutcome::Forwarded);
	assert_eq!(rx.try_recv().ok(), Some(Outbound::Payload(Bytes::from_static(b"{\"lat\":1}"))));
	assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delivery_without_connection_is_still_acked() {
	let registry = ConnectionRegistry::new();
	let (_, id, _) = alice();
	let acks = Arc::new(AtomicUsize::new(0));

	let outcome = forward_delivery(&registry, &id, delivery(b"x", &acks)).await;

	assert_eq!(outcome, ForwardOutcome::NoConnection);
	assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delivery_to_dead_socket_is_dropped_and_acked() {
	let registry = ConnectionRegistry::new();
	let (_, id, _) = alice();
	drop(register(&registry, &id, 1));
	let acks = Arc::new(AtomicUsize::new(0));

	let outcome = forward_delivery(&registry, &id, delivery(b"x", &acks)).await;

	assert_eq!(outcome, ForwardOutcome::Dropped);
	assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_relays_published_messages_to_every_device_of_the_user() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry.clone(), WEBSOCKET_EXCHANGE);

	let phone = Principal::new("alice", "phoneA").unwrap();
	let tablet = Principal::new("alice", "tablet").unwrap();
	let mut rx_phone = register(&registry, &LocationTopic::queue_name(&phone), 1);
	let mut rx_tablet = register(&registry, &LocationTopic::queue_name(&tablet), 2);

	for p in [&phone, &tablet] {
		bridge
			.open_for_identity(&LocationTopic::queue_name(p), &LocationTopic::routing_pattern(p))
			.await
			.unwrap();
	}
	assert_eq!(bridge.consumer_count(), 2);

	let key = LocationTopic::user_broadcast_key("alice").unwrap();
	broker
		.publish(WEBSOCKET_EXCHANGE, &key, Bytes::from_static(b"here"))
		.await
		.unwrap();

	for rx in [&mut rx_phone, &mut rx_tablet] {
		let got = timeout(Duration::from_millis(500), rx.recv()).await.unwrap().unwrap();
		assert_eq!(got, Outbound::Payload(Bytes::from_static(b"here")));
	}
	wait_for_acks(&broker, "location.alice.phoneA", 1).await;
	wait_for_acks(&broker, "location.alice.tablet", 1).await;
}

#[tokio::test]
async fn other_users_messages_are_not_relayed() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry.clone(), WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();
	let mut rx = register(&registry, &id, 1);
	bridge.open_for_identity(&id, &pattern).await.unwrap();

	broker
		.publish(WEBSOCKET_EXCHANGE, "location.bob.*", Bytes::from_static(b"nope"))
		.await
		.unwrap();

	assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

#[tokio::test]
async fn close_deletes_queue_and_is_idempotent() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry, WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();

	bridge.open_for_identity(&id, &pattern).await.unwrap();
	assert!(broker.has_queue(id.as_str()));
	assert_eq!(broker.bindings()[0].pattern, "location.alice.*");

	assert!(bridge.close_for_identity(&id).await);
	assert!(!broker.has_queue(id.as_str()));
	assert!(!bridge.has_consumer(&id));

	assert!(!bridge.close_for_identity(&id).await);
}

#[tokio::test]
async fn reopening_replaces_the_existing_queue() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry, WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();

	bridge.open_for_identity(&id, &pattern).await.unwrap();
	bridge.open_for_identity(&id, &pattern).await.unwrap();

	assert_eq!(bridge.consumer_count(), 1);
	assert_eq!(broker.queue_names(), vec![id.as_str().to_string()]);
}

#[tokio::test]
async fn setup_failure_leaves_no_consumer() {
	let broker = MemoryBroker::new();
	broker.fail_subscriptions(true);
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry, WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();

	let err = bridge.open_for_identity(&id, &pattern).await.unwrap_err();
	assert!(matches!(err, BrokerError::Setup { .. }));
	assert!(!bridge.has_consumer(&id));
	assert!(broker.queue_names().is_empty());
}

#[tokio::test]
async fn close_all_tears_down_every_queue() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry, WEBSOCKET_EXCHANGE);

	for device in ["a", "b", "c"] {
		let p = Principal::new("alice", device).unwrap();
		bridge
			.open_for_identity(&LocationTopic::queue_name(&p), &LocationTopic::routing_pattern(&p))
			.await
			.unwrap();
	}

	bridge.close_all().await;
	assert_eq!(bridge.consumer_count(), 0);
	assert!(broker.queue_names().is_empty());
}

#[tokio::test]
async fn delivery_to_saturated_connection_is_dropped_and_acked() {
	let registry = ConnectionRegistry::new();
	let (_, id, _) = alice();
	let (handle, mut rx) = ConnectionHandle::with_capacity(1, 1);
	registry.register(id.clone(), ConnectionRecord::new(handle, Arc::new(Liveness::default())));
	let acks = Arc::new(AtomicUsize::new(0));

	assert_eq!(
		forward_delivery(&registry, &id, delivery(b"first", &acks)).await,
		ForwardOutcome::Forwarded
	);
	assert_eq!(
		forward_delivery(&registry, &id, delivery(b"second", &acks)).await,
		ForwardOutcome::Dropped
	);
	assert_eq!(acks.load(Ordering::SeqCst), 2);
	assert_eq!(rx.try_recv().ok(), Some(Outbound::Payload(Bytes::from_static(b"first"))));
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn lost_subscription_closes_its_connection() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry.clone(), WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();
	let mut rx = register(&registry, &id, 1);
	bridge.open_for_identity(&id, &pattern).await.unwrap();

	// Queue deleted behind the bridge's back.
	broker.unsubscribe(&bridge.binding_for(&id, &pattern)).await.unwrap();

	let got = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
	assert_eq!(got, Some(Outbound::Close(CloseReason::SubscriptionLost)));
}

#[tokio::test]
async fn lost_subscription_spares_a_newer_connection() {
	let broker = MemoryBroker::new();
	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::new(broker.clone()), registry.clone(), WEBSOCKET_EXCHANGE);
	let (_, id, pattern) = alice();
	let _old = register(&registry, &id, 1);
	bridge.open_for_identity(&id, &pattern).await.unwrap();

	let (handle, mut newer) = ConnectionHandle::channel(2);
	registry.register(id.clone(), ConnectionRecord::new(handle, Arc::new(Liveness::default())));
	broker.unsubscribe(&bridge.binding_for(&id, &pattern)).await.unwrap();

	assert!(timeout(Duration::from_millis(100), newer.recv()).await.is_err());
}
