#![forbid(unsafe_code)]

mod amqp;
mod memory;

use core::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
	#[error("broker connect failed: {0}")]
	Connect(String),
	#[error("queue setup failed for {queue}: {reason}")]
	Setup { queue: String, reason: String },
	#[error("queue {0} is already in use")]
	QueueInUse(String),
	#[error("broker channel error: {0}")]
	Channel(String),
	#[error("publish failed: {0}")]
	Publish(String),
	#[error("ack failed: {0}")]
	Ack(String),
	#[error("broker connection is closed")]
	Closed,
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acker: Send + 'static {
	async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A message taken off a connection's queue.
pub struct Delivery {
	pub routing_key: String,
	pub payload: Bytes,
	acker: Box<dyn Acker>,
}

impl Delivery {
	pub fn new(routing_key: impl Into<String>, payload: Bytes, acker: Box<dyn Acker>) -> Self {
		Self {
			routing_key: routing_key.into(),
			payload,
			acker,
		}
	}

	/// Consumes the delivery, so it can be acked at most once.
	pub async fn ack(self) -> Result<(), BrokerError> {
		self.acker.ack().await
	}
}

impl fmt::Debug for Delivery {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Delivery")
			.field("routing_key", &self.routing_key)
			.field("payload_len", &self.payload.len())
			.finish()
	}
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Exclusive queue bound to the shared exchange with one pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
	pub queue: String,
	pub exchange: String,
	pub pattern: String,
}

/// Message broker seam used by the bridge.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
	/// Declare the exclusive queue, assert the topic exchange, bind, and start consuming.
	async fn subscribe(&self, binding: &QueueBinding) -> Result<DeliveryStream, BrokerError>;

	/// Unbind and delete the queue. Missing queues are not an error.
	async fn unsubscribe(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

	/// Publish one message to a topic exchange.
	async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError>;

	async fn close(&self);

	fn is_connected(&self) -> bool;
}
