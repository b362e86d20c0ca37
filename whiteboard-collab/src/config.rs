//! Process configuration, read from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `WHITEBOARD_BIND_ADDR` | `127.0.0.1:9090` |
//! | `WHITEBOARD_DATA_DIR` | `whiteboard_data/hot_log` |
//! | `WHITEBOARD_SNAPSHOT_DIR` | `whiteboard_data/snapshots` |
//! | `WHITEBOARD_RELAY_URL` | unset (single process) |
//! | `WHITEBOARD_RELAY_BIND_ADDR` | `127.0.0.1:9091` |
//! | `WHITEBOARD_AUTH_TOKENS` | empty (comma separated) |
//! | `SKIP_AUTH` | unset |
//!
//! The store directories are used by whichever process owns room storage:
//! a server without `WHITEBOARD_RELAY_URL`, or the relay hub.

use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::{AllowAll, Authenticator, StaticTokens};
use crate::compaction::CompactionPolicy;
use crate::relay::RelayConfig;
use crate::server::ServerConfig;
use crate::storage::{SnapshotConfig, StoreConfig};

#[derive(Debug, Clone, Default)]
pub struct WhiteboardConfig {
    pub server: ServerConfig,
    pub hot_log: StoreConfig,
    pub snapshots: SnapshotConfig,
    pub compaction: CompactionPolicy,
    pub relay: RelayConfig,
    /// Relay hub to join; `None` keeps fan-out and storage in this process
    pub relay_url: Option<String>,
    pub auth_tokens: Vec<String>,
    pub skip_auth: bool,
}

impl WhiteboardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("WHITEBOARD_BIND_ADDR") {
            config.server.bind_addr = addr;
        }
        if let Some(dir) = get("WHITEBOARD_DATA_DIR") {
            config.hot_log.path = PathBuf::from(dir);
        }
        if let Some(dir) = get("WHITEBOARD_SNAPSHOT_DIR") {
            config.snapshots.root = PathBuf::from(dir);
        }
        if let Some(addr) = get("WHITEBOARD_RELAY_BIND_ADDR") {
            config.relay.bind_addr = addr;
        }
        config.relay_url = get("WHITEBOARD_RELAY_URL");
        config.auth_tokens = get("WHITEBOARD_AUTH_TOKENS")
            .map(|tokens| {
                tokens
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        config.skip_auth = lookup("SKIP_AUTH").is_some_and(|v| !matches!(v.trim(), "0" | "false"));
        config
    }

    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        if self.skip_auth {
            log::warn!("SKIP_AUTH is set: accepting unauthenticated connections");
            return Arc::new(AllowAll);
        }
        if self.auth_tokens.is_empty() {
            log::warn!("No auth tokens configured: every connection will be rejected");
        }
        Arc::new(StaticTokens::new(self.auth_tokens.iter().cloned()))
    }
}
