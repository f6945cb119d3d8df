#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tracing::debug;
use waypoint_domain::TopicIdentity;

/// Why the gateway asked a connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// A newer connection registered the same identity.
	Superseded,
	/// The gateway is shutting down.
	Shutdown,
	/// Broker subscription could not be set up.
	SetupFailed,
	/// The broker ended the connection's subscription.
	SubscriptionLost,
}

impl CloseReason {
	pub fn as_str(self) -> &'static str {
		match self {
			CloseReason::Superseded => "superseded",
			CloseReason::Shutdown => "shutdown",
			CloseReason::SetupFailed => "setup failed",
			CloseReason::SubscriptionLost => "subscription lost",
		}
	}
}

/// Payload and probe slots buffered per connection before forwards are dropped.
pub const OUTBOUND_BUFFER: usize = 256;

/// Commands from the gateway to one connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
	/// Relay a broker payload verbatim.
	Payload(Bytes),
	/// Send a liveness probe (WebSocket ping).
	Probe,
	/// Close the socket with a close frame.
	Close(CloseReason),
	/// Drop the socket without a close handshake.
	Terminate,
}

/// Out-of-band stop request; never queued behind payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
	Close(CloseReason),
	Terminate,
}

impl Stop {
	fn outbound(self) -> Outbound {
		match self {
			Stop::Close(reason) => Outbound::Close(reason),
			Stop::Terminate => Outbound::Terminate,
		}
	}
}

#[derive(Debug, Error)]
#[error("connection {conn_id} is gone or not keeping up")]
pub struct ForwardError {
	pub conn_id: u64,
}

/// Cheap handle used to push frames to a live connection.
///
/// Payloads and probes share a bounded queue and are never awaited on; close
/// and terminate go through a separate signal the socket task watches even
/// while a write is stuck.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	tx: mpsc::Sender<Outbound>,
	stop: Arc<watch::Sender<Option<Stop>>>,
}

impl ConnectionHandle {
	/// Create a handle together with the outbox its socket task drains.
	pub fn channel(conn_id: u64) -> (Self, Outbox) {
		Self::with_capacity(conn_id, OUTBOUND_BUFFER)
	}

	pub fn with_capacity(conn_id: u64, capacity: usize) -> (Self, Outbox) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let (stop_tx, stop_rx) = watch::channel(None);
		let handle = Self {
			conn_id,
			tx,
			stop: Arc::new(stop_tx),
		};
		let outbox = Outbox {
			rx,
			stop: stop_rx,
			delivered: None,
			stop_open: true,
		};
		(handle, outbox)
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	fn try_send(&self, msg: Outbound) -> Result<(), ForwardError> {
		self.tx.try_send(msg).map_err(|_| ForwardError { conn_id: self.conn_id })
	}

	/// Queue a payload; fails when the connection is gone or its buffer is full.
	pub fn forward(&self, payload: Bytes) -> Result<(), ForwardError> {
		self.try_send(Outbound::Payload(payload))
	}

	pub fn probe(&self) -> Result<(), ForwardError> {
		self.try_send(Outbound::Probe)
	}

	pub fn close(&self, reason: CloseReason) {
		self.signal(Stop::Close(reason));
	}

	pub fn terminate(&self) {
		self.signal(Stop::Terminate);
	}

	// First close wins; terminate may still escalate a pending close.
	fn signal(&self, stop: Stop) {
		self.stop.send_if_modified(|current| match (*current, stop) {
			(None, _) | (Some(Stop::Close(_)), Stop::Terminate) => {
				*current = Some(stop);
				true
			}
			_ => false,
		});
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Receiving side of a `ConnectionHandle`, owned by the socket task.
#[derive(Debug)]
pub struct Outbox {
	rx: mpsc::Receiver<Outbound>,
	stop: watch::Receiver<Option<Stop>>,
	delivered: Option<Stop>,
	stop_open: bool,
}

impl Outbox {
	fn pending_stop(&mut self) -> Option<Outbound> {
		let current = *self.stop.borrow_and_update();
		if current.is_some() && current != self.delivered {
			self.delivered = current;
			return current.map(Stop::outbound);
		}
		None
	}

	/// Next command; stop requests jump ahead of queued payloads.
	pub async fn recv(&mut self) -> Option<Outbound> {
		loop {
			if let Some(cmd) = self.pending_stop() {
				return Some(cmd);
			}

			tokio::select! {
				biased;
				changed = self.stop.changed(), if self.stop_open => {
					if changed.is_err() {
						self.stop_open = false;
					}
				}
				cmd = self.rx.recv() => return cmd,
			}
		}
	}

	/// Resolves with the next stop request; never resolves if none can arrive.
	///
	/// Cancel safe, meant to race a socket write.
	pub async fn stopped(&mut self) -> Outbound {
		loop {
			if let Some(cmd) = self.pending_stop() {
				return cmd;
			}
			if !self.stop_open || self.stop.changed().await.is_err() {
				self.stop_open = false;
				return std::future::pending().await;
			}
		}
	}

	pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
		if let Some(cmd) = self.pending_stop() {
			return Ok(cmd);
		}
		self.rx.try_recv()
	}
}

/// Probe bookkeeping shared between the socket task and the liveness monitor.
#[derive(Debug)]
pub struct Liveness {
	alive: AtomicBool,
	missed: AtomicU32,
}

impl Default for Liveness {
	fn default() -> Self {
		Self {
			alive: AtomicBool::new(true),
			missed: AtomicU32::new(0),
		}
	}
}

impl Liveness {
	/// Called when the peer answers a probe.
	pub fn mark_alive(&self) {
		self.alive.store(true, Ordering::Release);
		self.missed.store(0, Ordering::Release);
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Acquire)
	}

	pub fn missed(&self) -> u32 {
		self.missed.load(Ordering::Acquire)
	}

	/// Arm a probe: clear the alive flag until the next answer.
	pub(crate) fn arm(&self) {
		self.alive.store(false, Ordering::Release);
	}

	pub(crate) fn record_miss(&self) -> u32 {
		self.missed.fetch_add(1, Ordering::AcqRel).saturating_add(1)
	}
}

/// One registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
	pub handle: ConnectionHandle,
	pub liveness: Arc<Liveness>,
}

impl ConnectionRecord {
	pub fn new(handle: ConnectionHandle, liveness: Arc<Liveness>) -> Self {
		Self { handle, liveness }
	}

	pub fn conn_id(&self) -> u64 {
		self.handle.conn_id()
	}
}

/// Identity -> live connection, at most one per identity.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	records: Mutex<HashMap<TopicIdentity, ConnectionRecord>>,
	locks: Mutex<HashMap<TopicIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install `record`, closing and returning whatever was registered before.
	pub fn register(&self, identity: TopicIdentity, record: ConnectionRecord) -> Option<ConnectionRecord> {
		let conn_id = record.conn_id();
		let prior = self.inner.records.lock().insert(identity.clone(), record);

		if let Some(prior) = &prior {
			debug!(
				identity = %identity,
				old_conn_id = prior.conn_id(),
				new_conn_id = conn_id,
				"registry: evicting prior connection"
			);
			prior.handle.close(CloseReason::Superseded);
		}

		prior
	}

	pub fn get(&self, identity: &TopicIdentity) -> Option<ConnectionHandle> {
		self.inner.records.lock().get(identity).map(|r| r.handle.clone())
	}

	pub fn get_record(&self, identity: &TopicIdentity) -> Option<ConnectionRecord> {
		self.inner.records.lock().get(identity).cloned()
	}

	/// Unconditional removal; idempotent.
	pub fn remove(&self, identity: &TopicIdentity) -> Option<ConnectionRecord> {
		self.inner.records.lock().remove(identity)
	}

	/// Remove only if the entry still belongs to `conn_id`.
	pub fn release(&self, identity: &TopicIdentity, conn_id: u64) -> bool {
		let mut records = self.inner.records.lock();
		match records.get(identity) {
			Some(record) if record.conn_id() == conn_id => {
				records.remove(identity);
				true
			}
			_ => false,
		}
	}

	/// Point-in-time copy; safe against concurrent mutation.
	pub fn snapshot(&self) -> Vec<(TopicIdentity, ConnectionRecord)> {
		self.inner
			.records
			.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	/// Visit every registered connection; `f` may freely mutate the registry.
	pub fn for_each(&self, mut f: impl FnMut(&TopicIdentity, &ConnectionRecord)) {
		for (identity, record) in self.snapshot() {
			f(&identity, &record);
		}
	}

	pub fn len(&self) -> usize {
		self.inner.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.records.lock().is_empty()
	}

	pub fn identities(&self) -> Vec<TopicIdentity> {
		let mut ids: Vec<_> = self.inner.records.lock().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Serialise multi-step work for one identity across `.await` points.
	pub async fn lock_identity(&self, identity: &TopicIdentity) -> OwnedMutexGuard<()> {
		let lock = {
			let mut locks = self.inner.locks.lock();
			Arc::clone(locks.entry(identity.clone()).or_default())
		};
		lock.lock_owned().await
	}

	/// Drop identity locks nobody holds or waits on.
	pub fn prune_idle_locks(&self) -> usize {
		let mut locks = self.inner.locks.lock();
		let before = locks.len();
		locks.retain(|_, lock| Arc::strong_count(lock) > 1);
		before - locks.len()
	}

	pub fn lock_count(&self) -> usize {
		self.inner.locks.lock().len()
	}
}
