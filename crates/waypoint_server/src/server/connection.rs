#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, info, warn};

use crate::server::gateway::Gateway;
use crate::server::registry::{CloseReason, ConnectionHandle, Liveness, Outbound, Outbox};
use crate::server::session::{Session, SessionEvent, SessionState};

/// Relay payloads as text when they are valid UTF-8, otherwise as binary.
pub fn payload_message(payload: Bytes) -> Message {
	match Utf8Bytes::try_from(payload.clone()) {
		Ok(text) => Message::Text(text),
		Err(_) => Message::Binary(payload),
	}
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
	Message::Close(Some(CloseFrame {
		code,
		reason: Utf8Bytes::from_static(reason),
	}))
}

fn close_frame_for(reason: CloseReason) -> Message {
	match reason {
		CloseReason::Superseded => close_frame(CloseCode::Normal, "superseded"),
		CloseReason::Shutdown => close_frame(CloseCode::Away, "shutdown"),
		CloseReason::SetupFailed => close_frame(CloseCode::Error, "broker unavailable"),
		CloseReason::SubscriptionLost => close_frame(CloseCode::Error, "subscription lost"),
	}
}

fn close_event_for(reason: CloseReason) -> SessionEvent {
	match reason {
		CloseReason::Superseded => SessionEvent::Superseded,
		CloseReason::Shutdown => SessionEvent::Shutdown,
		CloseReason::SetupFailed | CloseReason::SubscriptionLost => SessionEvent::SocketClosed,
	}
}

/// Upper bound on flushing a close frame to a peer that may have stopped reading.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

enum Written {
	Sent,
	Failed(WsError),
	/// A close or terminate request arrived before the write finished.
	Interrupted(Outbound),
}

/// Write one frame unless a stop request preempts it.
async fn write_unless_stopped(sink: &mut WsSink, outbox: &mut Outbox, msg: Message) -> Written {
	tokio::select! {
		biased;
		stop = outbox.stopped() => Written::Interrupted(stop),
		sent = sink.send(msg) => match sent {
			Ok(()) => Written::Sent,
			Err(e) => Written::Failed(e),
		},
	}
}

async fn reject(sink: &mut WsSink, frame: Message) {
	let _ = timeout(CLOSE_FLUSH_TIMEOUT, async {
		let _ = sink.send(frame).await;
		let _ = sink.close().await;
	})
	.await;
}

enum Step {
	Command(Option<Outbound>),
	Frame(Option<Result<Message, WsError>>),
}

/// Serve one device connection from handshake to teardown.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	remote: SocketAddr,
	gateway: Arc<Gateway>,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("waypoint_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("waypoint_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut session = Session::new(conn_id);

	let handshake = async {
		let mut headers = HeaderMap::new();
		let ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
			headers = req.headers().clone();
			Ok(resp)
		})
		.await
		.context("websocket handshake")?;
		let verdict = gateway.authenticator().authenticate(&headers).await;
		anyhow::Ok((ws, verdict))
	};

	let (ws, verdict) = match timeout(gateway.handshake_timeout(), handshake).await {
		Ok(result) => result?,
		Err(_) => {
			metrics::counter!("waypoint_handshake_timeouts_total").increment(1);
			warn!(conn_id, %remote, "handshake timed out");
			let _ = session.apply(SessionEvent::SocketClosed);
			return Ok(());
		}
	};

	let (mut sink, mut inbound) = ws.split();
	if session.apply(SessionEvent::Accepted).is_err() {
		reject(&mut sink, close_frame(CloseCode::Error, "internal error")).await;
		return Ok(());
	}

	let principal = match verdict {
		Ok(principal) => principal,
		Err(e) => {
			metrics::counter!("waypoint_auth_failures_total", "reason" => e.kind()).increment(1);
			warn!(conn_id, %remote, error = %e, "authentication failed");
			let _ = session.apply(SessionEvent::AuthRejected);
			reject(&mut sink, close_frame(CloseCode::Policy, "unauthorized")).await;
			return Ok(());
		}
	};

	if session.state() != SessionState::Authenticating {
		warn!(conn_id, state = ?session.state(), "refusing to bind outside authentication");
		reject(&mut sink, close_frame(CloseCode::Error, "internal error")).await;
		return Ok(());
	}

	let (handle, mut outbox) = ConnectionHandle::channel(conn_id);
	let liveness = Arc::new(Liveness::default());

	let identity = match gateway.bind(&principal, handle, Arc::clone(&liveness)).await {
		Ok(identity) => identity,
		Err(e) => {
			warn!(conn_id, principal = %principal, error = %e, "closing connection after broker setup failure");
			let reason = if gateway.is_shutting_down() {
				CloseReason::Shutdown
			} else {
				CloseReason::SetupFailed
			};
			if session.apply(SessionEvent::SetupFailed).is_ok() {
				reject(&mut sink, close_frame_for(reason)).await;
				let _ = session.apply(SessionEvent::Released);
			}
			return Ok(());
		}
	};

	if session.apply(SessionEvent::Authenticated).is_err() {
		gateway.unbind(&identity, conn_id).await;
		reject(&mut sink, close_frame(CloseCode::Error, "internal error")).await;
		return Ok(());
	}
	info!(conn_id, %remote, identity = %identity, "connection bound");

	let mut graceful = true;
	let mut deferred: Option<Outbound> = None;

	while session.state() == SessionState::Bound {
		let step = match deferred.take() {
			Some(cmd) => Step::Command(Some(cmd)),
			None => tokio::select! {
				cmd = outbox.recv() => Step::Command(cmd),
				frame = inbound.next() => Step::Frame(frame),
			},
		};

		let exit = match step {
			Step::Command(Some(Outbound::Payload(payload))) => {
				match write_unless_stopped(&mut sink, &mut outbox, payload_message(payload)).await {
					Written::Sent => None,
					Written::Interrupted(stop) => {
						deferred = Some(stop);
						None
					}
					Written::Failed(e) => {
						debug!(conn_id, error = %e, "send failed");
						Some(SessionEvent::SocketClosed)
					}
				}
			}
			Step::Command(Some(Outbound::Probe)) => {
				match write_unless_stopped(&mut sink, &mut outbox, Message::Ping(Bytes::new())).await {
					Written::Sent => None,
					Written::Interrupted(stop) => {
						deferred = Some(stop);
						None
					}
					Written::Failed(e) => {
						debug!(conn_id, error = %e, "probe send failed");
						Some(SessionEvent::SocketClosed)
					}
				}
			}
			Step::Command(Some(Outbound::Close(reason))) => {
				debug!(conn_id, reason = reason.as_str(), "closing connection");
				let flushed = timeout(
					CLOSE_FLUSH_TIMEOUT,
					write_unless_stopped(&mut sink, &mut outbox, close_frame_for(reason)),
				)
				.await;
				if !matches!(flushed, Ok(Written::Sent)) {
					graceful = false;
				}
				Some(close_event_for(reason))
			}
			Step::Command(Some(Outbound::Terminate)) => {
				graceful = false;
				Some(SessionEvent::Terminated)
			}
			Step::Command(None) => Some(SessionEvent::SocketClosed),
			Step::Frame(Some(Ok(Message::Pong(_)))) => {
				liveness.mark_alive();
				None
			}
			Step::Frame(Some(Ok(Message::Close(_))) | None) => Some(SessionEvent::SocketClosed),
			// Inbound application frames carry no meaning here.
			Step::Frame(Some(Ok(_))) => None,
			Step::Frame(Some(Err(e))) => {
				debug!(conn_id, error = %e, "socket read failed");
				Some(SessionEvent::SocketClosed)
			}
		};

		if let Some(event) = exit
			&& session.apply(event).is_err()
		{
			break;
		}
	}

	if graceful {
		let _ = timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
	}
	drop(sink);
	drop(inbound);

	if session.state() != SessionState::Closing {
		warn!(conn_id, state = ?session.state(), "tearing down connection outside closing state");
	}
	let released = gateway.unbind(&identity, conn_id).await;
	let _ = session.apply(SessionEvent::Released);
	info!(conn_id, identity = %identity, released, "connection closed");

	Ok(())
}
