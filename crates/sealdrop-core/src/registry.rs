//! Account registry for the legacy password-authenticated retrieval mode.
//!
//! Passwords are stored as Argon2 PHC strings, never in the clear. The
//! registry only backs the `account` auth mode; the auth-code scheme is the
//! default and does not consult it.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyExists,
    WeakPassword(String),
}

const SPECIAL_CHARS: &str = "!@#$%^&*()\":{}|<>";

/// Why a password fails policy, or `None` when it passes.
pub fn password_policy_violation(password: &str) -> Option<String> {
    if password.len() < 8 {
        return Some("password must be at least 8 characters long".into());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Some("password must contain at least one lowercase letter".into());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Some("password must contain at least one uppercase letter".into());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("password must contain at least one digit".into());
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        return Some("password must contain at least one special character".into());
    }
    None
}

#[derive(Default)]
pub struct UserRegistry {
    users: Mutex<HashMap<String, String>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str, password: &str) -> Result<RegisterOutcome, RegistryError> {
        if let Some(reason) = password_policy_violation(password) {
            return Ok(RegisterOutcome::WeakPassword(reason));
        }
        let mut users = self.users.lock();
        if users.contains_key(address) {
            return Ok(RegisterOutcome::AlreadyExists);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| RegistryError::Hash(e.to_string()))?;
        users.insert(address.to_string(), hash.to_string());
        Ok(RegisterOutcome::Registered)
    }

    pub fn authenticate(&self, address: &str, password: &str) -> bool {
        let stored = {
            let users = self.users.lock();
            match users.get(address) {
                Some(hash) => hash.clone(),
                None => return false,
            }
        };
        let Ok(parsed) = PasswordHash::new(&stored) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_authenticate() {
        let registry = UserRegistry::new();
        assert_eq!(
            registry
                .register("alice@example.com", "Securepass123!")
                .unwrap(),
            RegisterOutcome::Registered
        );
        assert!(registry.authenticate("alice@example.com", "Securepass123!"));
        assert!(!registry.authenticate("alice@example.com", "Securepass123?"));
        assert!(!registry.authenticate("bob@example.com", "Securepass123!"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = UserRegistry::new();
        registry
            .register("alice@example.com", "Securepass123!")
            .unwrap();
        assert_eq!(
            registry
                .register("alice@example.com", "Otherpass456!")
                .unwrap(),
            RegisterOutcome::AlreadyExists
        );
    }

    #[test]
    fn weak_passwords_name_the_rule() {
        let registry = UserRegistry::new();
        let cases = [
            ("short", "8 characters"),
            ("alllowercase1!", "uppercase"),
            ("ALLUPPERCASE1!", "lowercase"),
            ("NoDigitsHere!", "digit"),
            ("NoSpecials123", "special"),
        ];
        for (password, needle) in cases {
            match registry.register("x@example.com", password).unwrap() {
                RegisterOutcome::WeakPassword(reason) => {
                    assert!(reason.contains(needle), "{password}: {reason}")
                }
                other => panic!("{password}: expected weak password, got {other:?}"),
            }
        }
    }
}
