#![forbid(unsafe_code)]

//! Throwaway RSA key pairs for local runs and tests. Never deploy these.

/// PKCS#1 private key paired with `DEV_PUBLIC_KEY_PEM`.
pub const DEV_PRIVATE_KEY_PEM: &str = include_str!("../fixtures/dev_private_key.pem");

/// SPKI public key, in the form the identity store holds.
pub const DEV_PUBLIC_KEY_PEM: &str = include_str!("../fixtures/dev_public_key.pem");

/// Second pair, for tokens that must fail verification against the dev key.
pub const OTHER_PRIVATE_KEY_PEM: &str = include_str!("../fixtures/other_private_key.pem");
pub const OTHER_PUBLIC_KEY_PEM: &str = include_str!("../fixtures/other_public_key.pem");
