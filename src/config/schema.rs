use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network traversal settings
    pub ice: IceConfig,
    /// Call lifecycle settings
    pub call: CallConfig,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers (none by default)
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: vec![],
        }
    }
}

impl IceConfig {
    /// Host candidates only; used for loopback calls and tests
    pub fn host_only() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }

    pub fn has_turn(&self) -> bool {
        !self.turn_servers.is_empty()
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }

    /// webrtc-rs refuses TURN entries without credentials
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.credential.is_empty()
    }
}

/// Call lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Delay between a call ending and the local call state returning to idle (ms)
    pub end_grace_ms: u64,
    /// A session that is not connected after this long is torn down (ms)
    pub connect_timeout_ms: u64,
    /// Maximum buffered signaling messages for a call that has no session yet
    pub early_message_limit: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            end_grace_ms: 1000,
            connect_timeout_ms: 30000,
            early_message_limit: 64,
        }
    }
}

impl CallConfig {
    pub fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_is_stun_only() {
        let ice = IceConfig::default();
        assert_eq!(ice.stun_servers.len(), 2);
        assert!(ice.stun_servers[0].starts_with("stun:"));
        assert!(!ice.has_turn());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"call":{"end_grace_ms":250}}"#).unwrap();
        assert_eq!(config.call.end_grace(), Duration::from_millis(250));
        assert_eq!(config.call.connect_timeout_ms, 30000);
        assert_eq!(config.ice.stun_servers.len(), 2);
    }

    #[test]
    fn test_turn_credentials() {
        let turn = TurnServer::new("turn:example.com:3478".into(), String::new(), "x".into());
        assert!(!turn.has_credentials());
    }
}
