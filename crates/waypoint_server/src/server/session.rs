#![forbid(unsafe_code)]

use thiserror::Error;

/// Lifecycle of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
	Connecting,
	Authenticating,
	Bound,
	Closing,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
	/// WebSocket handshake completed.
	Accepted,
	/// Token verified, registered, queue bound.
	Authenticated,
	AuthRejected,
	/// Broker queue setup failed after authentication.
	SetupFailed,
	/// Peer closed or the socket errored.
	SocketClosed,
	/// Liveness monitor gave up on the peer.
	Terminated,
	/// A newer connection took over the identity.
	Superseded,
	Shutdown,
	/// Registry entry and queue released.
	Released,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid session transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
	pub from: SessionState,
	pub event: SessionEvent,
}

impl SessionState {
	pub fn on(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
		use SessionEvent as E;
		use SessionState as S;

		let next = match (self, event) {
			(S::Connecting, E::Accepted) => S::Authenticating,
			(S::Connecting, E::SocketClosed | E::Shutdown) => S::Closed,

			(S::Authenticating, E::Authenticated) => S::Bound,
			(S::Authenticating, E::AuthRejected | E::SocketClosed | E::Shutdown) => S::Closed,
			(S::Authenticating, E::SetupFailed) => S::Closing,

			(S::Bound, E::SocketClosed | E::Terminated | E::Superseded | E::Shutdown) => S::Closing,

			(S::Closing, E::Released) => S::Closed,
			(S::Closing, E::SocketClosed | E::Terminated | E::Superseded | E::Shutdown) => S::Closing,

			(from, event) => return Err(InvalidTransition { from, event }),
		};

		Ok(next)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, SessionState::Closed)
	}
}

/// Tracks one connection's state, logging rejected transitions.
#[derive(Debug, Clone)]
pub struct Session {
	conn_id: u64,
	state: SessionState,
}

impl Session {
	pub fn new(conn_id: u64) -> Self {
		Self {
			conn_id,
			state: SessionState::Connecting,
		}
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
		match self.state.on(event) {
			Ok(next) => {
				tracing::trace!(conn_id = self.conn_id, from = ?self.state, to = ?next, ?event, "session transition");
				self.state = next;
				Ok(next)
			}
			Err(e) => {
				tracing::warn!(conn_id = self.conn_id, error = %e, "session transition rejected");
				Err(e)
			}
		}
	}
}
