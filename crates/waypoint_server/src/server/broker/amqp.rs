#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use lapin::options::{
	BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
	QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Acker, Broker, BrokerError, Delivery, DeliveryStream, QueueBinding};

/// RabbitMQ broker over lapin.
///
/// Each subscription gets its own channel, so a channel-level fault on one
/// queue never tears down another connection's consumer.
pub struct AmqpBroker {
	conn: Connection,
	publish_channel: Channel,
	channels: Mutex<HashMap<String, Channel>>,
}

struct AmqpAcker {
	acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
	async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
		self.acker
			.ack(BasicAckOptions::default())
			.await
			.map_err(|e| BrokerError::Ack(e.to_string()))
	}
}

fn setup_error(queue: &str, e: lapin::Error) -> BrokerError {
	BrokerError::Setup {
		queue: queue.to_string(),
		reason: e.to_string(),
	}
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
	channel
		.exchange_declare(
			exchange,
			ExchangeKind::Topic,
			ExchangeDeclareOptions {
				durable: false,
				..ExchangeDeclareOptions::default()
			},
			FieldTable::default(),
		)
		.await
}

impl AmqpBroker {
	pub async fn connect(url: &str) -> Result<Self, BrokerError> {
		let conn = Connection::connect(url, ConnectionProperties::default())
			.await
			.map_err(|e| BrokerError::Connect(e.to_string()))?;

		conn.on_error(|e| {
			metrics::counter!("waypoint_broker_connection_errors_total").increment(1);
			warn!(error = %e, "amqp connection error");
		});

		let publish_channel = conn
			.create_channel()
			.await
			.map_err(|e| BrokerError::Connect(e.to_string()))?;

		info!("amqp broker connected");

		Ok(Self {
			conn,
			publish_channel,
			channels: Mutex::new(HashMap::new()),
		})
	}

	async fn usable_channel(&self, channel: Option<Channel>) -> Result<Channel, BrokerError> {
		match channel {
			Some(channel) if channel.status().connected() => Ok(channel),
			_ => self
				.conn
				.create_channel()
				.await
				.map_err(|e| BrokerError::Channel(e.to_string())),
		}
	}
}

#[async_trait]
impl Broker for AmqpBroker {
	async fn subscribe(&self, binding: &QueueBinding) -> Result<DeliveryStream, BrokerError> {
		let queue = binding.queue.as_str();
		let channel = self.conn.create_channel().await.map_err(|e| setup_error(queue, e))?;

		channel
			.queue_declare(
				queue,
				QueueDeclareOptions {
					exclusive: true,
					durable: false,
					..QueueDeclareOptions::default()
				},
				FieldTable::default(),
			)
			.await
			.map_err(|e| setup_error(queue, e))?;

		declare_exchange(&channel, &binding.exchange)
			.await
			.map_err(|e| setup_error(queue, e))?;

		channel
			.queue_bind(
				queue,
				&binding.exchange,
				&binding.pattern,
				QueueBindOptions::default(),
				FieldTable::default(),
			)
			.await
			.map_err(|e| setup_error(queue, e))?;

		let consumer = channel
			.basic_consume(queue, queue, BasicConsumeOptions::default(), FieldTable::default())
			.await
			.map_err(|e| setup_error(queue, e))?;

		self.channels.lock().insert(binding.queue.clone(), channel);
		debug!(queue, pattern = %binding.pattern, "amqp queue bound and consuming");

		let stream = consumer.map(|res| {
			res.map(|d| {
				Delivery::new(
					d.routing_key.as_str(),
					Bytes::from(d.data),
					Box::new(AmqpAcker { acker: d.acker }),
				)
			})
			.map_err(|e| BrokerError::Channel(e.to_string()))
		});

		Ok(stream.boxed())
	}

	async fn unsubscribe(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
		let removed = self.channels.lock().remove(&binding.queue);
		let Some(channel) = removed else {
			return Ok(());
		};

		let channel = self.usable_channel(Some(channel)).await?;
		let queue = binding.queue.as_str();

		if let Err(e) = channel
			.queue_unbind(queue, &binding.exchange, &binding.pattern, FieldTable::default())
			.await
		{
			debug!(queue, error = %e, "amqp unbind failed (ignored)");
		}

		// A failed unbind closes the channel; delete on a fresh one.
		let channel = self.usable_channel(Some(channel)).await?;
		if let Err(e) = channel.queue_delete(queue, QueueDeleteOptions::default()).await {
			debug!(queue, error = %e, "amqp queue delete failed (ignored)");
		}

		if channel.status().connected()
			&& let Err(e) = channel.close(200, "unsubscribe").await
		{
			debug!(queue, error = %e, "amqp channel close failed (ignored)");
		}

		Ok(())
	}

	async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError> {
		declare_exchange(&self.publish_channel, exchange)
			.await
			.map_err(|e| BrokerError::Publish(e.to_string()))?;

		self.publish_channel
			.basic_publish(
				exchange,
				routing_key,
				BasicPublishOptions::default(),
				&payload,
				BasicProperties::default(),
			)
			.await
			.map_err(|e| BrokerError::Publish(e.to_string()))?
			.await
			.map_err(|e| BrokerError::Publish(e.to_string()))?;

		Ok(())
	}

	async fn close(&self) {
		let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
		for channel in channels {
			let _ = channel.close(200, "shutdown").await;
		}
		if let Err(e) = self.conn.close(200, "shutdown").await {
			debug!(error = %e, "amqp connection close failed (ignored)");
		}
	}

	fn is_connected(&self) -> bool {
		self.conn.status().connected()
	}
}
