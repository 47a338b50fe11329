//! Keyed authentication codes for protocol commands.
//!
//! Every command line crosses the wire as `<command-bytes>\n<hex-code>`,
//! where the code is an HMAC-SHA-256 over the command bytes. The receiver
//! recomputes the code over everything before the final line and compares
//! in constant time. A mismatch is a protocol-level rejection, not a crash.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the shared secret as hex.
pub const AUTH_KEY_ENV: &str = "SEALDROP_AUTH_KEY";

#[derive(Debug, Error)]
pub enum AuthCodeError {
    #[error("authentication key is not configured (set {AUTH_KEY_ENV} or auth_key_hex)")]
    MissingKey,

    #[error("authentication key is not valid hex: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("authentication key must not be empty")]
    EmptyKey,
}

/// Shared secret for command authentication, loaded once at startup.
#[derive(Clone)]
pub struct AuthCodeKey {
    key: Zeroizing<Vec<u8>>,
}

impl AuthCodeKey {
    pub fn from_hex(hex_key: &str) -> Result<Self, AuthCodeError> {
        let key = hex::decode(hex_key.trim())?;
        if key.is_empty() {
            return Err(AuthCodeError::EmptyKey);
        }
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    /// Load the key from the environment. Absence is fatal at startup.
    pub fn from_env() -> Result<Self, AuthCodeError> {
        match std::env::var(AUTH_KEY_ENV) {
            Ok(v) if !v.trim().is_empty() => Self::from_hex(&v),
            _ => Err(AuthCodeError::MissingKey),
        }
    }

    /// Hex-encoded HMAC-SHA-256 over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Recompute and compare in constant time.
    pub fn verify(&self, message: &[u8], code: &str) -> bool {
        let Ok(expected) = hex::decode(code.trim()) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(message);
        mac.verify_slice(&expected).is_ok()
    }
}
