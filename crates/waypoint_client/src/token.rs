#![forbid(unsafe_code)]

//! Device token minting.
//!
//! Produces compact JWS tokens (`header.claims.signature`) signed with an RSA
//! private key, which is what the gateway verifies.

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, get_current_timestamp};
use waypoint_domain::{DeviceClaims, SigningAlgorithm};

use crate::ClientError;

fn jwt_algorithm(alg: SigningAlgorithm) -> Algorithm {
	match alg {
		SigningAlgorithm::Rs256 => Algorithm::RS256,
		SigningAlgorithm::Rs384 => Algorithm::RS384,
		SigningAlgorithm::Rs512 => Algorithm::RS512,
	}
}

/// Sign `claims` with `private_key_pem` (PKCS#1 or PKCS#8 PEM).
pub fn mint_token(private_key_pem: &str, alg: SigningAlgorithm, claims: &DeviceClaims) -> Result<String, ClientError> {
	let key = EncodingKey::from_rsa_pem(private_key_pem.trim().as_bytes())
		.map_err(|e| ClientError::Token(format!("invalid private key: {e}")))?;

	encode(&Header::new(jwt_algorithm(alg)), claims, &key).map_err(|e| ClientError::Token(format!("signing failed: {e}")))
}

/// Mint a token for `username`/`device_id` valid for `ttl` from now.
pub fn mint_for(
	private_key_pem: &str,
	alg: SigningAlgorithm,
	username: &str,
	device_id: &str,
	ttl: Duration,
) -> Result<String, ClientError> {
	let now = get_current_timestamp();

	let claims = DeviceClaims {
		username: username.to_string(),
		device_id: device_id.to_string(),
		exp: now.saturating_add(ttl.as_secs()),
		iat: Some(now),
	};
	mint_token(private_key_pem, alg, &claims)
}
