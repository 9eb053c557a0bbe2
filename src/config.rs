// Logging can only be switched off in debug builds; release builds stay silent.

use crate::error::CallError;
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence logging in a debug build.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// STUN servers used when the configuration does not name any.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Tunables for one endpoint's call engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// How long an unanswered call keeps ringing.
    pub ring_timeout_ms: u64,
    /// How long a disconnected transport may take to come back.
    pub disconnect_grace_ms: u64,
    pub cleanup_attempts: u32,
    pub cleanup_backoff_ms: u64,
    pub store_op_timeout_ms: u64,
    /// Pending records older than this are treated as orphans.
    pub stale_session_ms: u64,
    pub media: MediaConstraints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ring_timeout_ms: 45_000,
            disconnect_grace_ms: 10_000,
            cleanup_attempts: 3,
            cleanup_backoff_ms: 500,
            store_op_timeout_ms: 5_000,
            stale_session_ms: 120_000,
            media: MediaConstraints::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, CallError> {
        serde_json::from_str(raw).map_err(|e| CallError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), CallError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config(format!(
                    "ice server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "turn server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.cleanup_attempts == 0 {
            return Err(CallError::Config("cleanup_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Configured servers, or the defaults when none are set.
    pub fn effective_ice_servers(&self) -> Vec<ServerConfig> {
        if self.ice_servers.is_empty() {
            DEFAULT_ICE_SERVERS.clone()
        } else {
            self.ice_servers.clone()
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn cleanup_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_backoff_ms)
    }

    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout_ms)
    }

    pub fn stale_session(&self) -> Duration {
        Duration::from_millis(self.stale_session_ms)
    }
}
