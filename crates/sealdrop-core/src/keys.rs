//! Per-address RSA key-pair provisioning.
//!
//! One 2048-bit pair per address, written as `<address>_private.pem`
//! (PKCS#8) and `<address>_public.pem` (SPKI) under the configured key
//! directory. The envelope loads them back by path.

use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};

use crate::envelope::EnvelopeError;

pub const RSA_BITS: usize = 2048;

pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), EnvelopeError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| EnvelopeError::KeyLoad(format!("key generation: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

pub fn private_key_path(key_dir: &Path, address: &str) -> PathBuf {
    key_dir.join(format!("{}_private.pem", sanitize(address)))
}

pub fn public_key_path(key_dir: &Path, address: &str) -> PathBuf {
    key_dir.join(format!("{}_public.pem", sanitize(address)))
}

/// Generate and persist a pair for `address`. Returns the two paths
/// (private, public).
pub fn provision(key_dir: &Path, address: &str) -> Result<(PathBuf, PathBuf), EnvelopeError> {
    std::fs::create_dir_all(key_dir)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", key_dir.display())))?;

    let (private_key, public_key) = generate_keypair()?;

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| EnvelopeError::KeyLoad(format!("encode private key: {e}")))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| EnvelopeError::KeyLoad(format!("encode public key: {e}")))?;

    let private_path = private_key_path(key_dir, address);
    let public_path = public_key_path(key_dir, address);
    std::fs::write(&private_path, private_pem.as_bytes())
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", private_path.display())))?;
    std::fs::write(&public_path, public_pem.as_bytes())
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {e}", public_path.display())))?;

    Ok((private_path, public_path))
}

/// Addresses become file-name stems; anything path-hostile is mapped away.
fn sanitize(address: &str) -> String {
    address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '@' || c == '.' || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope;

    #[test]
    fn provision_writes_loadable_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (private_path, public_path) = provision(dir.path(), "alice@example.com").unwrap();

        let public_key = envelope::load_public_key(&public_path).unwrap();
        let private_key = envelope::load_private_key(&private_path).unwrap();

        let parts = envelope::encrypt(b"provisioned", &public_key).unwrap();
        assert_eq!(envelope::decrypt(&parts, &private_key).unwrap(), b"provisioned");
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize("alice@example.com"), "alice@example.com");
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
    }
}
