#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use waypoint_domain::{DEFAULT_AUTH_HEADER, SecretString};
use waypoint_util::endpoint::WsEndpoint;

#[cfg(any(test, feature = "dev-keys"))]
pub mod dev_keys;
pub mod token;

/// Local dev gateway endpoint.
pub const DEFAULT_GATEWAY_ENDPOINT: &str = "ws://127.0.0.1:9080";

/// Device session configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
	/// Gateway endpoint in `ws://host:port` form.
	pub endpoint: String,

	/// Upgrade request header carrying the token.
	pub auth_header: String,

	pub token: SecretString,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl DeviceConfig {
	pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			auth_header: DEFAULT_AUTH_HEADER.to_string(),
			token: SecretString::new(token),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// The endpoint string could not be parsed.
	#[error("invalid endpoint: {0}")]
	Endpoint(String),

	/// Connection or handshake failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Token minting failed.
	#[error("token error: {0}")]
	Token(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),

	#[error("timed out after {0:?}")]
	Timeout(Duration),
}

impl From<anyhow::Error> for ClientError {
	fn from(e: anyhow::Error) -> Self {
		ClientError::Io(format!("{e:#}"))
	}
}

/// What the gateway delivered to this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
	Text(String),
	Binary(Bytes),
	Closed { code: Option<u16>, reason: String },
}

/// One authenticated device connection.
pub struct DeviceSession {
	ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DeviceSession {
	/// Open the socket, presenting the token in `cfg.auth_header`.
	pub async fn connect(cfg: &DeviceConfig) -> Result<Self, ClientError> {
		let endpoint = WsEndpoint::parse(&cfg.endpoint).map_err(ClientError::Endpoint)?;

		let mut request = endpoint
			.url()
			.into_client_request()
			.map_err(|e| ClientError::Endpoint(e.to_string()))?;
		let name = HeaderName::from_bytes(cfg.auth_header.as_bytes())
			.map_err(|e| ClientError::Protocol(format!("invalid auth header name: {e}")))?;
		let value = HeaderValue::from_str(cfg.token.expose())
			.map_err(|e| ClientError::Token(format!("token is not a valid header value: {e}")))?;
		request.headers_mut().insert(name, value);

		let (ws, response) = tokio::time::timeout(cfg.connect_timeout, connect_async(request))
			.await
			.map_err(|_| ClientError::Timeout(cfg.connect_timeout))?
			.map_err(|e| ClientError::Connect(e.to_string()))?;

		info!(endpoint = %endpoint.url(), status = %response.status(), "connected to gateway");
		Ok(Self { ws })
	}

	/// Wait for the next payload or close. Returns `None` once the socket is gone.
	///
	/// Pings are answered while reading, so callers must keep polling to stay alive.
	pub async fn next_event(&mut self) -> Result<Option<DeviceEvent>, ClientError> {
		loop {
			let Some(frame) = self.ws.next().await else {
				return Ok(None);
			};
			let frame = frame.map_err(|e| ClientError::Io(e.to_string()))?;

			match frame {
				Message::Text(text) => return Ok(Some(DeviceEvent::Text(text.as_str().to_string()))),
				Message::Binary(data) => return Ok(Some(DeviceEvent::Binary(data))),
				Message::Close(frame) => {
					let (code, reason) = match frame {
						Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_string()),
						None => (None, String::new()),
					};
					return Ok(Some(DeviceEvent::Closed { code, reason }));
				}
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
					debug!("control frame");
				}
			}
		}
	}

	/// The gateway ignores inbound payloads; useful only for probing that behavior.
	pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
		self.ws
			.send(Message::text(text))
			.await
			.map_err(|e| ClientError::Io(e.to_string()))
	}

	pub async fn close(mut self) -> Result<(), ClientError> {
		self.ws.close(None).await.map_err(|e| ClientError::Io(e.to_string()))
	}
}
