//! Hybrid encryption envelope for message bodies.
//!
//! Each message gets a fresh 256-bit AES key and 128-bit IV. The body is
//! AES-256-CBC encrypted with PKCS#7 padding; the AES key is wrapped with
//! RSA-OAEP (SHA-256 for both the digest and the MGF1 mask function).
//!
//! Wire fields per message: `encrypted_key`, `iv`, `ciphertext`.
//! Transport security is a separate concern; the envelope protects the
//! body in transit and at rest even when the transport is not trusted.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES key size in bytes (256-bit).
pub const SYMMETRIC_KEY_LEN: usize = 32;
/// AES block / IV size in bytes (128-bit).
pub const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("key load failed: {0}")]
    KeyLoad(String),

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    Decryption,
}

/// The three encrypted components of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeParts {
    /// AES key wrapped with the recipient's RSA public key.
    pub encrypted_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` for the holder of `public_key`.
///
/// Consumes randomness for the one-time AES key and IV; everything else is
/// deterministic given those.
pub fn encrypt(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<EnvelopeParts, EnvelopeError> {
    let mut aes_key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    OsRng.fill_bytes(&mut aes_key[..]);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let encrypted_key = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &aes_key[..])
        .map_err(|e| EnvelopeError::KeyWrap(e.to_string()))?;

    let ciphertext = Aes256CbcEnc::new_from_slices(&aes_key[..], &iv)
        .map_err(|e| EnvelopeError::KeyWrap(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(EnvelopeParts {
        encrypted_key,
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Decrypt one envelope with the recipient's private key.
///
/// A failure here means this single message is unreadable; callers skip the
/// message and keep going, they never tear down the session over it.
pub fn decrypt(parts: &EnvelopeParts, private_key: &RsaPrivateKey) -> Result<Vec<u8>, EnvelopeError> {
    let modulus = private_key.size();
    if parts.encrypted_key.len() != modulus {
        return Err(EnvelopeError::MalformedCiphertext(format!(
            "encrypted key is {} bytes, expected {}",
            parts.encrypted_key.len(),
            modulus
        )));
    }
    if parts.iv.len() != IV_LEN {
        return Err(EnvelopeError::MalformedCiphertext(format!(
            "iv is {} bytes, expected {}",
            parts.iv.len(),
            IV_LEN
        )));
    }

    let aes_key = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), &parts.encrypted_key)
            .map_err(|_| EnvelopeError::Decryption)?,
    );
    if aes_key.len() != SYMMETRIC_KEY_LEN {
        return Err(EnvelopeError::Decryption);
    }

    Aes256CbcDec::new_from_slices(&aes_key[..], &parts.iv)
        .map_err(|_| EnvelopeError::Decryption)?
        .decrypt_padded_vec_mut::<Pkcs7>(&parts.ciphertext)
        .map_err(|_| EnvelopeError::Decryption)
}

/// Modulus size in bytes; the expected length of a wrapped key.
pub fn modulus_size(private_key: &RsaPrivateKey) -> usize {
    private_key.size()
}

/// Load an SPKI PEM public key from disk.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, EnvelopeError> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", path.display())))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", path.display())))
}

/// Load a PKCS#8 PEM private key from disk.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, EnvelopeError> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", path.display())))?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", path.display())))
}
