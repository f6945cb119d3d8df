#![forbid(unsafe_code)]

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use waypoint_domain::{DeviceClaims, Principal, SigningAlgorithm};

use crate::server::identity::{IdentityStore, StoreError};

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing auth token")]
	MissingToken,
	#[error("malformed token: {0}")]
	Malformed(&'static str),
	#[error("unknown user")]
	UnknownUser,
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("invalid public key: {0}")]
	InvalidKey(String),
	#[error("token algorithm {found} does not match expected {expected}")]
	AlgorithmMismatch {
		expected: SigningAlgorithm,
		found: String,
	},
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("token claims missing username or deviceId")]
	InvalidClaims,
}

impl AuthError {
	/// Short label for metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			AuthError::MissingToken => "missing_token",
			AuthError::Malformed(_) => "malformed",
			AuthError::UnknownUser => "unknown_user",
			AuthError::Store(_) => "store",
			AuthError::InvalidKey(_) => "invalid_key",
			AuthError::AlgorithmMismatch { .. } => "algorithm_mismatch",
			AuthError::BadSignature => "bad_signature",
			AuthError::Expired => "expired",
			AuthError::InvalidClaims => "invalid_claims",
		}
	}
}

impl From<jsonwebtoken::errors::Error> for AuthError {
	fn from(err: jsonwebtoken::errors::Error) -> Self {
		match err.kind() {
			ErrorKind::ExpiredSignature => AuthError::Expired,
			ErrorKind::InvalidSignature => AuthError::BadSignature,
			ErrorKind::InvalidRsaKey(reason) => AuthError::InvalidKey(reason.clone()),
			ErrorKind::InvalidKeyFormat => AuthError::InvalidKey("unsupported key format".to_string()),
			ErrorKind::MissingRequiredClaim(_) | ErrorKind::Json(_) => AuthError::InvalidClaims,
			ErrorKind::Base64(_) | ErrorKind::Utf8(_) => AuthError::Malformed("segment is not base64url"),
			_ => AuthError::Malformed("expected header.claims.signature"),
		}
	}
}

fn jwt_algorithm(alg: SigningAlgorithm) -> Algorithm {
	match alg {
		SigningAlgorithm::Rs256 => Algorithm::RS256,
		SigningAlgorithm::Rs384 => Algorithm::RS384,
		SigningAlgorithm::Rs512 => Algorithm::RS512,
	}
}

/// Turns upgrade request headers into a verified `Principal`.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
	store: Arc<dyn IdentityStore>,
	header_name: String,
	algorithm: SigningAlgorithm,
}

impl ConnectionAuthenticator {
	pub fn new(store: Arc<dyn IdentityStore>, header_name: impl Into<String>, algorithm: SigningAlgorithm) -> Self {
		Self {
			store,
			header_name: header_name.into().to_ascii_lowercase(),
			algorithm,
		}
	}

	pub fn header_name(&self) -> &str {
		&self.header_name
	}

	pub fn algorithm(&self) -> SigningAlgorithm {
		self.algorithm
	}

	/// Authenticate one upgrade request. Performs a single read-only store lookup.
	pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
		let token = extract_token(headers, &self.header_name)?;

		let unverified = decode_unverified_claims(&token)?;
		if unverified.username.trim().is_empty() {
			return Err(AuthError::InvalidClaims);
		}

		let raw_key = self
			.store
			.public_key(&unverified.username)
			.await?
			.ok_or(AuthError::UnknownUser)?;

		let key = decoding_key(&raw_key)?;
		let claims = verify_token(&token, &key, self.algorithm)?;

		if claims.username != unverified.username {
			return Err(AuthError::BadSignature);
		}

		claims.principal().map_err(|_| AuthError::InvalidClaims)
	}
}

fn extract_token(headers: &HeaderMap, header_name: &str) -> Result<String, AuthError> {
	let mut values = headers.get_all(header_name).iter();
	let value = values.next().ok_or(AuthError::MissingToken)?;
	if values.next().is_some() {
		return Err(AuthError::MissingToken);
	}

	let token = value.to_str().map_err(|_| AuthError::MissingToken)?.trim();
	if token.is_empty() {
		return Err(AuthError::MissingToken);
	}

	Ok(token.to_string())
}

/// Read the claims without checking the signature (only to pick the key to verify with).
pub fn decode_unverified_claims(token: &str) -> Result<DeviceClaims, AuthError> {
	let mut validation = Validation::default();
	validation.insecure_disable_signature_validation();
	validation.validate_exp = false;
	validation.validate_aud = false;
	validation.required_spec_claims.clear();

	decode::<DeviceClaims>(token, &DecodingKey::from_secret(&[]), &validation)
		.map(|data| data.claims)
		.map_err(|err| match err.kind() {
			ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => AuthError::Malformed("claims are not valid JSON"),
			_ => AuthError::from(err),
		})
}

/// Verify signature, algorithm and expiry, returning the trusted claims.
pub fn verify_token(token: &str, key: &DecodingKey, expected: SigningAlgorithm) -> Result<DeviceClaims, AuthError> {
	let header = decode_header(token).map_err(|_| AuthError::Malformed("header is not valid JSON"))?;
	let alg = jwt_algorithm(expected);
	if header.alg != alg {
		return Err(AuthError::AlgorithmMismatch {
			expected,
			found: format!("{:?}", header.alg),
		});
	}

	let mut validation = Validation::new(alg);
	validation.leeway = 0;
	validation.validate_aud = false;
	validation.set_required_spec_claims(&["exp"]);

	let claims = decode::<DeviceClaims>(token, key, &validation)?.claims;
	if claims.username.trim().is_empty() || claims.device_id.trim().is_empty() {
		return Err(AuthError::InvalidClaims);
	}

	Ok(claims)
}

/// Bring a stored key into PEM form.
///
/// Stored keys may be full PEM, PEM with literal `\n` escapes, or a bare base64 body.
pub fn normalize_public_key(raw: &str) -> String {
	let unescaped = raw.replace("\\n", "\n");
	let trimmed = unescaped.trim();
	if trimmed.starts_with("-----BEGIN") {
		return trimmed.to_string();
	}

	let body: Vec<char> = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
	let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
	for line in body.chunks(64) {
		pem.extend(line);
		pem.push('\n');
	}
	pem.push_str("-----END PUBLIC KEY-----");
	pem
}

/// Build a verification key from a stored SPKI or PKCS#1 public key.
pub fn decoding_key(raw: &str) -> Result<DecodingKey, AuthError> {
	DecodingKey::from_rsa_pem(normalize_public_key(raw).as_bytes()).map_err(|err| match err.kind() {
		ErrorKind::InvalidRsaKey(reason) => AuthError::InvalidKey(reason.clone()),
		other => AuthError::InvalidKey(format!("{other:?}")),
	})
}

#[cfg(test)]
mod tests {
	use base64::Engine as _;
	use base64::engine::general_purpose::URL_SAFE_NO_PAD;
	use tokio_tungstenite::tungstenite::http::HeaderValue;
	use waypoint_client::dev_keys;
	use jsonwebtoken::get_current_timestamp;
	use waypoint_client::token::mint_token;

	use super::*;
	use crate::server::identity::StaticIdentityStore;

	fn claims(username: &str, device_id: &str, exp: u64) -> DeviceClaims {
		DeviceClaims {
			username: username.to_string(),
			device_id: device_id.to_string(),
			exp,
			iat: None,
		}
	}

	fn future_exp() -> u64 {
		get_current_timestamp() + 3600
	}

	fn authenticator() -> ConnectionAuthenticator {
		let store = StaticIdentityStore::new().with_key("alice", dev_keys::DEV_PUBLIC_KEY_PEM);
		ConnectionAuthenticator::new(Arc::new(store), "asimovlives", SigningAlgorithm::Rs512)
	}

	fn headers_with(token: &str) -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert("asimovlives", HeaderValue::from_str(token).unwrap());
		headers
	}

	fn dev_token(c: &DeviceClaims, alg: SigningAlgorithm) -> String {
		mint_token(dev_keys::DEV_PRIVATE_KEY_PEM, alg, c).unwrap()
	}

	#[tokio::test]
	async fn valid_token_yields_principal() {
		let token = dev_token(&claims("alice", "phoneA", future_exp()), SigningAlgorithm::Rs512);
		let principal = authenticator().authenticate(&headers_with(&token)).await.unwrap();
		assert_eq!(principal.username(), "alice");
		assert_eq!(principal.device_id(), "phoneA");
	}

	#[tokio::test]
	async fn missing_or_empty_header_is_rejected() {
		let auth = authenticator();
		assert!(matches!(
			auth.authenticate(&HeaderMap::new()).await,
			Err(AuthError::MissingToken)
		));
		assert!(matches!(
			auth.authenticate(&headers_with("  ")).await,
			Err(AuthError::MissingToken)
		));

		let token = dev_token(&claims("alice", "phoneA", future_exp()), SigningAlgorithm::Rs512);
		let mut headers = headers_with(&token);
		headers.append("asimovlives", HeaderValue::from_str(&token).unwrap());
		assert!(matches!(auth.authenticate(&headers).await, Err(AuthError::MissingToken)));
	}

	#[tokio::test]
	async fn header_lookup_is_case_insensitive() {
		let store = StaticIdentityStore::new().with_key("alice", dev_keys::DEV_PUBLIC_KEY_PEM);
		let auth = ConnectionAuthenticator::new(Arc::new(store), "AsimovLives", SigningAlgorithm::Rs512);
		let token = dev_token(&claims("alice", "phoneA", future_exp()), SigningAlgorithm::Rs512);
		assert!(auth.authenticate(&headers_with(&token)).await.is_ok());
	}

	#[tokio::test]
	async fn expired_token_is_rejected() {
		let token = dev_token(&claims("alice", "phoneA", get_current_timestamp() - 1), SigningAlgorithm::Rs512);
		assert!(matches!(
			authenticator().authenticate(&headers_with(&token)).await,
			Err(AuthError::Expired)
		));
	}

	#[tokio::test]
	async fn token_signed_by_other_key_is_rejected() {
		let token = mint_token(
			dev_keys::OTHER_PRIVATE_KEY_PEM,
			SigningAlgorithm::Rs512,
			&claims("alice", "phoneA", future_exp()),
		)
		.unwrap();
		assert!(matches!(
			authenticator().authenticate(&headers_with(&token)).await,
			Err(AuthError::BadSignature)
		));
	}

	#[tokio::test]
	async fn unknown_user_is_rejected() {
		let token = dev_token(&claims("mallory", "x", future_exp()), SigningAlgorithm::Rs512);
		assert!(matches!(
			authenticator().authenticate(&headers_with(&token)).await,
			Err(AuthError::UnknownUser)
		));
	}

	#[tokio::test]
	async fn algorithm_must_match_configuration() {
		let token = dev_token(&claims("alice", "phoneA", future_exp()), SigningAlgorithm::Rs256);
		let err = authenticator().authenticate(&headers_with(&token)).await.unwrap_err();
		assert!(matches!(err, AuthError::AlgorithmMismatch { .. }));
		assert_eq!(err.kind(), "algorithm_mismatch");
	}

	#[tokio::test]
	async fn empty_device_id_is_rejected() {
		let token = dev_token(&claims("alice", "", future_exp()), SigningAlgorithm::Rs512);
		assert!(matches!(
			authenticator().authenticate(&headers_with(&token)).await,
			Err(AuthError::InvalidClaims)
		));
	}

	#[tokio::test]
	async fn malformed_tokens_are_rejected() {
		let auth = authenticator();
		for bad in ["not-a-token", "a.b", "a.b.c.d", "!!!.???.###"] {
			assert!(
				matches!(auth.authenticate(&headers_with(bad)).await, Err(AuthError::Malformed(_))),
				"expected malformed for {bad}"
			);
		}
	}

	#[tokio::test]
	async fn tampered_claims_fail_verification() {
		let token = dev_token(&claims("alice", "phoneA", future_exp()), SigningAlgorithm::Rs512);
		let mut parts: Vec<&str> = token.split('.').collect();
		let forged = URL_SAFE_NO_PAD.encode(br#"{"username":"alice","deviceId":"tablet","exp":99999999999}"#);
		parts[1] = &forged;
		let forged_token = parts.join(".");
		assert!(matches!(
			authenticator().authenticate(&headers_with(&forged_token)).await,
			Err(AuthError::BadSignature)
		));
	}

	#[test]
	fn bare_and_escaped_keys_are_normalized() {
		let pem = dev_keys::DEV_PUBLIC_KEY_PEM.trim();
		let body: String = pem.lines().filter(|l| !l.starts_with("-----")).collect();

		let wrapped = normalize_public_key(&body);
		assert!(wrapped.starts_with("-----BEGIN PUBLIC KEY-----\n"));
		assert!(decoding_key(&body).is_ok());

		let escaped = pem.replace('\n', "\\n");
		assert!(decoding_key(&escaped).is_ok());
		assert!(decoding_key("definitely not a key").is_err());
	}

	#[test]
	fn verify_token_allows_no_clock_leeway() {
		let key = decoding_key(dev_keys::DEV_PUBLIC_KEY_PEM).unwrap();
		let fresh = dev_token(&claims("alice", "phoneA", get_current_timestamp() + 30), SigningAlgorithm::Rs512);
		assert_eq!(verify_token(&fresh, &key, SigningAlgorithm::Rs512).unwrap().device_id, "phoneA");

		let stale = dev_token(&claims("alice", "phoneA", get_current_timestamp() - 5), SigningAlgorithm::Rs512);
		assert!(matches!(
			verify_token(&stale, &key, SigningAlgorithm::Rs512),
			Err(AuthError::Expired)
		));
	}

	#[test]
	fn claims_without_expiry_are_rejected() {
		let key = decoding_key(dev_keys::DEV_PUBLIC_KEY_PEM).unwrap();
		let header = jsonwebtoken::Header::new(Algorithm::RS512);
		let signer = jsonwebtoken::EncodingKey::from_rsa_pem(dev_keys::DEV_PRIVATE_KEY_PEM.as_bytes()).unwrap();
		let token = jsonwebtoken::encode(
			&header,
			&serde_json::json!({ "username": "alice", "deviceId": "phoneA" }),
			&signer,
		)
		.unwrap();

		assert!(matches!(
			verify_token(&token, &key, SigningAlgorithm::Rs512),
			Err(AuthError::InvalidClaims)
		));
	}
}
