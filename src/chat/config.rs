//! Chat client configuration

use crate::network::NetworkError;

/// Relay endpoint used when none is configured
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

/// Public STUN servers for ICE
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Chat client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    pub server_url: String,
    /// Name to register with; prompt the user when absent
    pub name: Option<String>,
    /// STUN/TURN URLs handed to the peer connection
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            name: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), NetworkError> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(NetworkError::Config(format!(
                "Invalid signaling server URL: {}. Must start with ws:// or wss://",
                self.server_url
            )));
        }

        if let Some(ref name) = self.name {
            if name.trim().is_empty() {
                return Err(NetworkError::Config("Name must not be empty".to_string()));
            }
        }

        for url in &self.ice_servers {
            if !["stun:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                return Err(NetworkError::Config(format!(
                    "Invalid ICE server URL: {}. Must start with stun:, turn: or turns:",
                    url
                )));
            }
        }

        Ok(())
    }
}
