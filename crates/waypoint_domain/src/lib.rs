#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Shared topic exchange every location publish travels through.
pub const WEBSOCKET_EXCHANGE: &str = "websocket.exchange";

/// Default HTTP header carrying the device token on the upgrade request.
pub const DEFAULT_AUTH_HEADER: &str = "asimovlives";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid segment {0:?}: must not contain '.', '*' or '#'")]
	InvalidSegment(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown signing algorithm: {0}")]
	UnknownAlgorithm(String),
}

/// Asymmetric token signing algorithms accepted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SigningAlgorithm {
	Rs256,
	Rs384,
	#[default]
	Rs512,
}

impl SigningAlgorithm {
	/// JOSE `alg` identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			SigningAlgorithm::Rs256 => "RS256",
			SigningAlgorithm::Rs384 => "RS384",
			SigningAlgorithm::Rs512 => "RS512",
		}
	}
}

impl fmt::Display for SigningAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SigningAlgorithm {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_uppercase().as_str() {
			"RS256" => Ok(SigningAlgorithm::Rs256),
			"RS384" => Ok(SigningAlgorithm::Rs384),
			"RS512" => Ok(SigningAlgorithm::Rs512),
			other => Err(ParseIdError::UnknownAlgorithm(other.to_string())),
		}
	}
}

fn validate_segment(value: &str) -> Result<(), ParseIdError> {
	if value.trim().is_empty() {
		return Err(ParseIdError::Empty);
	}
	if value.contains(['.', '*', '#']) {
		return Err(ParseIdError::InvalidSegment(value.to_string()));
	}
	Ok(())
}

/// Authenticated `(username, device_id)` pair identifying one device session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
	username: String,
	device_id: String,
}

impl Principal {
	/// Both parts must be non-empty and free of topic separators/wildcards.
	pub fn new(username: impl Into<String>, device_id: impl Into<String>) -> Result<Self, ParseIdError> {
		let username = username.into();
		let device_id = device_id.into();
		validate_segment(&username)?;
		validate_segment(&device_id)?;
		Ok(Self { username, device_id })
	}

	pub fn username(&self) -> &str {
		&self.username
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}
}

impl fmt::Display for Principal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.username, self.device_id)
	}
}

/// Queue name of one live device connection (`location.<username>.<deviceId>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicIdentity(String);

impl TopicIdentity {
	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for TopicIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TopicIdentity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let principal = LocationTopic::parse(s)?;
		Ok(LocationTopic::queue_name(&principal))
	}
}

/// Topic helpers for location routing.
///
/// Queues are named after the full principal so each device gets its own
/// queue, while bindings only pin the username so any publish addressed to
/// that user reaches every one of their devices.
pub struct LocationTopic;

impl LocationTopic {
	/// First word of every location topic.
	pub const PREFIX: &'static str = "location";

	/// Queue name for `principal`: `location.<username>.<deviceId>`.
	pub fn queue_name(principal: &Principal) -> TopicIdentity {
		TopicIdentity(format!("{}.{}.{}", Self::PREFIX, principal.username, principal.device_id))
	}

	/// Binding pattern for `principal`: `location.<username>.*`.
	pub fn routing_pattern(principal: &Principal) -> String {
		format!("{}.{}.*", Self::PREFIX, principal.username)
	}

	/// Routing key a publisher uses to address `principal`.
	pub fn routing_key(principal: &Principal) -> String {
		Self::queue_name(principal).into_string()
	}

	/// Routing key addressed to every device of `username`.
	///
	/// Publishers use the literal word `*` here; it matches the `*` wildcard
	/// in each device's binding like any other word.
	pub fn user_broadcast_key(username: &str) -> Result<String, ParseIdError> {
		validate_segment(username)?;
		Ok(format!("{}.{}.*", Self::PREFIX, username))
	}

	/// Parse `location.<username>.<deviceId>` back into a principal.
	pub fn parse(s: &str) -> Result<Principal, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.and_then(|r| r.strip_prefix('.'))
			.ok_or_else(|| ParseIdError::InvalidFormat("expected location.<username>.<deviceId>".into()))?;

		let (username, device_id) = rest
			.split_once('.')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected location.<username>.<deviceId>".into()))?;

		Principal::new(username, device_id)
	}

	/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
	pub fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
		let pattern: Vec<&str> = pattern.split('.').collect();
		let key: Vec<&str> = routing_key.split('.').collect();
		match_words(&pattern, &key)
	}
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
	match pattern.split_first() {
		None => key.is_empty(),
		Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
		Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
		Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
	}
}

/// Claims carried by a device token.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceClaims {
	pub username: String,
	#[serde(rename = "deviceId")]
	pub device_id: String,
	/// Expiry, seconds since the Unix epoch.
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<u64>,
}

#[cfg(feature = "serde")]
impl DeviceClaims {
	pub fn principal(&self) -> Result<Principal, ParseIdError> {
		Principal::new(self.username.clone(), self.device_id.clone())
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
