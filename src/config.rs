//! Mesh configuration

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeshError, Result};
use crate::media::MediaConstraints;
use crate::webrtc::mdns::{parse_mdns_mode, MdnsMode, MDNS_MODE_ENV};

/// Relay base address used when nothing is configured
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080";

/// Public STUN server used when nothing is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Environment variable overriding the relay base address
pub const RELAY_URL_ENV: &str = "ROOM_MESH_RELAY_URL";

/// Environment variable overriding the STUN server
pub const STUN_SERVER_ENV: &str = "ROOM_MESH_STUN_SERVER_URL";

/// Mesh session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Relay base URL; the room and participant id are appended as path segments
    pub relay_url: String,
    /// STUN server URLs handed to every peer transport
    pub stun_servers: Vec<String>,
    /// What to capture on join
    pub media: MediaConstraints,
    /// mDNS candidate handling for every peer transport
    pub mdns_mode: MdnsMode,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            media: MediaConstraints::default(),
            mdns_mode: MdnsMode::default(),
        }
    }
}

impl MeshConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup; blank values are ignored
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = value(RELAY_URL_ENV) {
            self.relay_url = url.trim_end_matches('/').to_string();
        }
        if let Some(stun) = value(STUN_SERVER_ENV) {
            self.stun_servers = vec![stun];
        }
        if let Some(raw) = value(MDNS_MODE_ENV) {
            match parse_mdns_mode(&raw) {
                Some(mode) => self.mdns_mode = mode,
                None => warn!(
                    "Unknown {} value {:?}, keeping {:?}",
                    MDNS_MODE_ENV, raw, self.mdns_mode
                ),
            }
        }
        self
    }

    /// Check the configuration before joining
    pub fn validate(&self) -> Result<()> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(MeshError::Config(format!(
                "relay url must be ws:// or wss://, got {}",
                self.relay_url
            )));
        }
        if self.stun_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(MeshError::Config("empty STUN server url".to_string()));
        }
        Ok(())
    }

    /// Relay endpoint for one participant in one room
    pub fn relay_endpoint(&self, room_id: &str, participant_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.relay_url.trim_end_matches('/'),
            room_id,
            participant_id
        )
    }
}
