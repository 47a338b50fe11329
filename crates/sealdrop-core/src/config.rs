//! Configuration for the server and balancer binaries.
//!
//! JSON files on disk; the auth-code secret may come from the environment
//! instead (`SEALDROP_AUTH_KEY` wins over `auth_key_hex`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One backing store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEndpoint {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub primary: StoreEndpoint,
    pub backup: StoreEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalSettings {
    pub reconcile_secs: u64,
    pub retention_sweep_secs: u64,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            reconcile_secs: 60,
            retention_sweep_secs: 30,
        }
    }
}

/// How retrieval connections authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Default: every command carries an HMAC line.
    AuthCode,
    /// Legacy: a `LOGIN:<address>:<password>` preamble checked against the
    /// account registry replaces the HMAC line.
    Account,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub submission_listen: String,
    pub retrieval_listen: String,
    pub tls: TlsSettings,
    pub stores: StoreSettings,
    #[serde(default)]
    pub intervals: IntervalSettings,
    #[serde(default = "default_retention_minutes")]
    pub default_retention_minutes: i64,
    #[serde(default = "default_read_timeout_ms")]
    pub retrieval_read_timeout_ms: u64,
    /// Honor the legacy bare-address retrieval form with no auth code.
    #[serde(default)]
    pub allow_unauthenticated_retrieval: bool,
    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,
    /// Fallback when SEALDROP_AUTH_KEY is unset.
    #[serde(default)]
    pub auth_key_hex: Option<String>,
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
}

fn default_retention_minutes() -> i64 {
    1
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_auth_mode() -> AuthMode {
    AuthMode::AuthCode
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_read_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.reconcile_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.retention_sweep_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub submission_listen: String,
    pub retrieval_listen: String,
    pub submission_backends: Vec<String>,
    pub retrieval_backends: Vec<String>,
}

impl BalancerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_server_config_gets_defaults() {
        let json = r#"{
            "submission_listen": "127.0.0.1:2525",
            "retrieval_listen": "127.0.0.1:2526",
            "tls": { "cert_path": "server.crt", "key_path": "server.key" },
            "stores": {
                "primary": { "type": "sqlite", "path": "primary.db" },
                "backup": { "type": "memory" }
            }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.default_retention_minutes, 1);
        assert_eq!(config.auth_mode, AuthMode::AuthCode);
        assert!(!config.allow_unauthenticated_retrieval);
        assert_eq!(config.intervals.reconcile_secs, 60);
        assert!(matches!(config.stores.backup, StoreEndpoint::Memory));
        assert!(matches!(config.stores.primary, StoreEndpoint::Sqlite { .. }));
    }

    #[test]
    fn balancer_config_parses() {
        let json = r#"{
            "submission_listen": "0.0.0.0:2525",
            "retrieval_listen": "0.0.0.0:2526",
            "submission_backends": ["127.0.0.1:1025", "127.0.0.1:1026"],
            "retrieval_backends": ["127.0.0.1:1101", "127.0.0.1:1102"]
        }"#;
        let config: BalancerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.submission_backends.len(), 2);
    }
}
