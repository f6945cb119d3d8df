#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// WebSocket URL scheme.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum WsScheme {
		Ws,
		Wss,
	}

	impl WsScheme {
		pub const fn as_str(self) -> &'static str {
			match self {
				WsScheme::Ws => "ws",
				WsScheme::Wss => "wss",
			}
		}
	}

	/// Parsed `ws://host:port` (or `wss://host:port`) endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub scheme: WsScheme,
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Full URL suitable for a client connect request.
		pub fn url(&self) -> String {
			format!("{}://{}:{}/", self.scheme.as_str(), self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse an endpoint string in the form `ws://host:port` or `wss://host:port`.
		///
		/// A single trailing `/` is tolerated; any other path, query or fragment is rejected.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (scheme, rest) = if let Some(rest) = s.strip_prefix("ws://") {
				(WsScheme::Ws, rest)
			} else if let Some(rest) = s.strip_prefix("wss://") {
				(WsScheme::Wss, rest)
			} else {
				return Err(format!("invalid endpoint (expected ws://host:port): {s}"));
			};

			let rest = rest.strip_suffix('/').unwrap_or(rest);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:9080): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = WsEndpoint::parse("wss://relay.example.com:443").unwrap();
			assert_eq!(e.scheme, WsScheme::Wss);
			assert_eq!(e.host, "relay.example.com");
			assert_eq!(e.port, 443);
			assert_eq!(e.url(), "wss://relay.example.com:443/");
		}

		#[test]
		fn parses_ipv4_with_trailing_slash() {
			let e = WsEndpoint::parse("ws://127.0.0.1:9080/").unwrap();
			assert_eq!(e.scheme, WsScheme::Ws);
			assert_eq!(e.hostport(), "127.0.0.1:9080");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:9080").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:9080");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = WsEndpoint::parse("ws://::1:9080").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(WsEndpoint::parse("http://127.0.0.1:9080").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:9080/ws").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:9080?x=y").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
		}

		#[test]
		fn to_socket_addr_if_ip_literal_rejects_dns() {
			let e = WsEndpoint::parse("ws://relay.example.com:9080").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
