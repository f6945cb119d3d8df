#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use waypoint_domain::{LocationTopic, Principal, TopicIdentity};

use crate::config::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::server::auth::ConnectionAuthenticator;
use crate::server::bridge::BrokerBridge;
use crate::server::broker::BrokerError;
use crate::server::connection::handle_connection;
use crate::server::registry::{CloseReason, ConnectionHandle, ConnectionRecord, ConnectionRegistry, Liveness};

/// Composition root shared by every connection task.
pub struct Gateway {
	registry: ConnectionRegistry,
	bridge: BrokerBridge,
	authenticator: ConnectionAuthenticator,
	handshake_timeout: Duration,
	next_conn_id: AtomicU64,
	shutting_down: AtomicBool,
}

impl Gateway {
	pub fn new(registry: ConnectionRegistry, bridge: BrokerBridge, authenticator: ConnectionAuthenticator) -> Self {
		Self {
			registry,
			bridge,
			authenticator,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			next_conn_id: AtomicU64::new(1),
			shutting_down: AtomicBool::new(false),
		}
	}

	/// Bound the upgrade plus authentication of each new socket.
	pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
		self.handshake_timeout = timeout;
		self
	}

	pub fn handshake_timeout(&self) -> Duration {
		self.handshake_timeout
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	pub fn bridge(&self) -> &BrokerBridge {
		&self.bridge
	}

	pub fn authenticator(&self) -> &ConnectionAuthenticator {
		&self.authenticator
	}

	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::Acquire)
	}

	/// Register an authenticated connection and open its queue.
	///
	/// Any prior connection for the same identity is closed and its queue is
	/// deleted before the new queue is declared. On broker failure the new
	/// registration is released and the connection is told to close.
	pub async fn bind(
		&self,
		principal: &Principal,
		handle: ConnectionHandle,
		liveness: Arc<Liveness>,
	) -> Result<TopicIdentity, BrokerError> {
		let identity = LocationTopic::queue_name(principal);
		let pattern = LocationTopic::routing_pattern(principal);
		let conn_id = handle.conn_id();

		let _guard = self.registry.lock_identity(&identity).await;

		if self.is_shutting_down() {
			handle.close(CloseReason::Shutdown);
			return Err(BrokerError::Closed);
		}

		if let Some(prior) = self
			.registry
			.register(identity.clone(), ConnectionRecord::new(handle.clone(), liveness))
		{
			metrics::counter!("waypoint_connections_superseded_total").increment(1);
			info!(
				identity = %identity,
				old_conn_id = prior.conn_id(),
				conn_id,
				"gateway: reconnect replaced prior connection"
			);
			self.bridge.close_for_identity(&identity).await;
		}

		if let Err(e) = self.bridge.open_for_identity(&identity, &pattern).await {
			metrics::counter!("waypoint_broker_setup_failures_total").increment(1);
			warn!(identity = %identity, conn_id, error = %e, "gateway: broker setup failed");
			self.registry.release(&identity, conn_id);
			handle.close(CloseReason::SetupFailed);
			return Err(e);
		}

		// Shutdown may have swept the registry and consumers while the queue was opening.
		if self.is_shutting_down() {
			self.bridge.close_for_identity(&identity).await;
			self.registry.release(&identity, conn_id);
			handle.close(CloseReason::Shutdown);
			return Err(BrokerError::Closed);
		}

		metrics::gauge!("waypoint_registered_connections").set(self.registry.len() as f64);
		Ok(identity)
	}

	/// Close path: release `conn_id`'s registration and queue if it is still current.
	pub async fn unbind(&self, identity: &TopicIdentity, conn_id: u64) -> bool {
		let _guard = self.registry.lock_identity(identity).await;

		if !self.registry.release(identity, conn_id) {
			debug!(identity = %identity, conn_id, "gateway: stale close, newer connection kept");
			return false;
		}

		self.bridge.close_for_identity(identity).await;
		metrics::gauge!("waypoint_registered_connections").set(self.registry.len() as f64);
		true
	}

	/// Close every connection and queue, then the broker connection.
	pub async fn shutdown(&self) {
		if self.shutting_down.swap(true, Ordering::AcqRel) {
			return;
		}

		let mut closed = 0usize;
		self.registry.for_each(|_, record| {
			record.handle.close(CloseReason::Shutdown);
			closed += 1;
		});
		info!(connections = closed, "gateway: shutting down");

		self.bridge.close_all().await;
		self.bridge.broker().close().await;
	}
}

/// How long `run_until` waits for connection tasks to flush close frames.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket accept loop.
pub struct GatewayServer {
	gateway: Arc<Gateway>,
	listener: TcpListener,
}

impl GatewayServer {
	pub async fn bind(addr: SocketAddr, gateway: Arc<Gateway>) -> std::io::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Self { gateway, listener })
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	pub fn gateway(&self) -> &Arc<Gateway> {
		&self.gateway
	}

	/// Accept until `shutdown` resolves, then shut the gateway down and wait
	/// for connection tasks to finish.
	pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
		tokio::pin!(shutdown);
		let mut connections = JoinSet::new();

		loop {
			tokio::select! {
				_ = &mut shutdown => break,
				Some(finished) = connections.join_next(), if !connections.is_empty() => {
					if let Err(e) = finished && e.is_panic() {
						warn!(error = %e, "connection task panicked");
					}
				}
				accepted = self.listener.accept() => match accepted {
					Ok((stream, remote)) => {
						let conn_id = self.gateway.next_conn_id();
						metrics::counter!("waypoint_connections_total").increment(1);
						debug!(conn_id, %remote, "accepted tcp connection");

						let gateway = Arc::clone(&self.gateway);
						connections.spawn(async move {
							if let Err(e) = handle_connection(conn_id, stream, remote, gateway).await {
								warn!(conn_id, error = %e, "connection handler exited with error");
							}
						});
					}
					Err(e) => {
						warn!(error = %e, "accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
					}
				}
			}
		}

		info!("gateway: stopped accepting");
		drop(self.listener);
		self.gateway.shutdown().await;

		let pending = connections.len();
		let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
			while connections.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!(remaining = connections.len(), "gateway: aborting connections that did not close in time");
			connections.shutdown().await;
		}
		info!(connections = pending, "gateway: connections drained");
	}
}
