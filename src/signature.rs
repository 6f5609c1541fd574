//! # Webhook Signatures
//!
//! Secret generation, digesting and HMAC-SHA256 signing for outbound deliveries,
//! plus verification for inbound callbacks. This is the only module that touches
//! raw secrets or computes MACs.
//!
//! A subscription's raw secret is shown to the operator once. The service keeps
//! `hex(sha256(secret))` and uses that digest as the HMAC key, so a subscriber
//! verifies a delivery with:
//!
//! ```text
//! key       = hex(sha256(secret))
//! signature = hex(hmac_sha256(key, body))
//! ```

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Prefix on every generated secret, so leaked values are easy to recognize.
pub const SECRET_PREFIX: &str = "whsec_";

/// Optional scheme prefix accepted on incoming signature headers.
pub const SIGNATURE_SCHEME_PREFIX: &str = "sha256=";

const SECRET_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Raw signing secret. Wiped from memory on drop and never logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RawSecret(String);

impl RawSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 digest persisted in place of the secret.
    pub fn digest(&self) -> String {
        secret_digest(&self.0)
    }
}

impl fmt::Debug for RawSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawSecret([REDACTED])")
    }
}

/// Generates a fresh 256-bit secret from the OS RNG.
pub fn generate_secret() -> RawSecret {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let secret = RawSecret(format!("{SECRET_PREFIX}{}", hex::encode(bytes)));
    bytes.zeroize();
    secret
}

/// Hex SHA-256 of a raw secret.
pub fn secret_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Signs `payload` with `key`, returning lowercase hex.
pub fn sign(payload: &[u8], key: &str) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against `payload` signed with `key`.
///
/// Accepts bare hex or `sha256=`-prefixed hex. Malformed input yields `false`.
pub fn verify(payload: &[u8], signature: &str, key: &str) -> bool {
    let provided_hex = signature
        .trim()
        .strip_prefix(SIGNATURE_SCHEME_PREFIX)
        .unwrap_or_else(|| signature.trim());

    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if provided.len() != expected.len() {
        return false;
    }

    provided.as_slice().ct_eq(expected.as_slice()).into()
}
