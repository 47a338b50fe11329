//! Shared per-process state handed to every connection handler.

use std::sync::Arc;
use std::time::Duration;

use sealdrop_core::authcode::AuthCodeKey;
use sealdrop_core::config::{AuthMode, ServerConfig};
use sealdrop_core::registry::UserRegistry;
use sealdrop_core::store::ReplicatedStore;

/// The slice of configuration the protocol handlers actually consult.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub default_retention_minutes: i64,
    pub read_timeout: Duration,
    pub allow_unauthenticated_retrieval: bool,
    pub auth_mode: AuthMode,
}

impl From<&ServerConfig> for ProtocolSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            default_retention_minutes: config.default_retention_minutes,
            read_timeout: config.read_timeout(),
            allow_unauthenticated_retrieval: config.allow_unauthenticated_retrieval,
            auth_mode: config.auth_mode,
        }
    }
}

pub struct ServerState {
    pub auth: AuthCodeKey,
    pub store: Arc<ReplicatedStore>,
    pub registry: Arc<UserRegistry>,
    pub settings: ProtocolSettings,
}
