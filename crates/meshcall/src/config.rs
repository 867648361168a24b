//! Configuration types for the mesh call client

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Signaling server used when none is configured
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";

/// Environment variable holding comma-separated TURN URLs
pub const TURN_URLS_ENV: &str = "MESHCALL_TURN_URLS";
/// Environment variable holding the TURN username
pub const TURN_USERNAME_ENV: &str = "MESHCALL_TURN_USERNAME";
/// Environment variable holding the TURN password
pub const TURN_PASSWORD_ENV: &str = "MESHCALL_TURN_PASSWORD";

/// Main configuration for a mesh call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshCallConfig {
    /// Signaling service base URL (ws:// or wss://)
    pub signaling_url: String,

    /// Room to join
    pub room_id: String,

    /// Display name announced to the room
    pub display_name: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Number of ICE candidates gathered ahead of negotiation (default: 10)
    pub ice_candidate_pool_size: u8,

    /// Timing and retry options
    pub options: ConfigOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Timing and retry options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOptions {
    /// Fixed delay before the signaling socket redials (default: 1500)
    pub signaling_reconnect_delay_ms: u64,

    /// Fixed delay before a failed peer connection is rebuilt (default: 2000)
    pub peer_restart_delay_ms: u64,

    /// Restarts allowed per peer before giving up (default: 3)
    pub max_restart_attempts: u32,

    /// Time allowed for remote media to arrive once connected (default: 8000)
    pub stream_watchdog_ms: u64,
}

impl Default for MeshCallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room_id: String::new(),
            display_name: String::new(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
            options: ConfigOptions::default(),
        }
    }
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            signaling_reconnect_delay_ms: 1500,
            peer_restart_delay_ms: 2000,
            max_restart_attempts: 3,
            stream_watchdog_ms: 8000,
        }
    }
}

impl ConfigOptions {
    pub fn signaling_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.signaling_reconnect_delay_ms)
    }

    pub fn peer_restart_delay(&self) -> Duration {
        Duration::from_millis(self.peer_restart_delay_ms)
    }

    pub fn stream_watchdog(&self) -> Duration {
        Duration::from_millis(self.stream_watchdog_ms)
    }
}

impl MeshCallConfig {
    /// Create a configuration for joining `room_id` as `display_name`
    pub fn new(signaling_url: &str, room_id: &str, display_name: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a valid WebSocket URL
    /// - `room_id` or `display_name` is empty
    /// - `stun_servers` is empty
    /// - a TURN entry is not a turn:/turns: URL
    /// - `max_restart_attempts` is zero or a delay is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.room_id.trim().is_empty() {
            return Err(Error::InvalidConfig("room_id must not be empty".to_string()));
        }

        if self.display_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "display_name must not be empty".to_string(),
            ));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.options.max_restart_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_restart_attempts must be at least 1".to_string(),
            ));
        }

        if self.options.signaling_reconnect_delay_ms == 0
            || self.options.peer_restart_delay_ms == 0
            || self.options.stream_watchdog_ms == 0
        {
            return Err(Error::InvalidConfig(
                "reconnect, restart and watchdog delays must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// WebSocket endpoint for this room
    ///
    /// `{signaling_url}/api/rooms/{room_id}/ws?name={display_name}`
    pub fn room_socket_url(&self) -> crate::Result<Url> {
        use crate::Error;

        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling_url: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| {
                Error::InvalidConfig(format!(
                    "signaling_url cannot carry a path: {}",
                    self.signaling_url
                ))
            })?
            .pop_if_empty()
            .extend(["api", "rooms", self.room_id.as_str(), "ws"]);

        url.query_pairs_mut()
            .clear()
            .append_pair("name", &self.display_name);

        Ok(url)
    }

    /// Replace the TURN server list
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Append TURN servers described by the `MESHCALL_TURN_*` environment variables
    pub fn with_turn_from_env(mut self) -> Self {
        let urls = std::env::var(TURN_URLS_ENV).ok();
        let username = std::env::var(TURN_USERNAME_ENV).ok();
        let password = std::env::var(TURN_PASSWORD_ENV).ok();

        self.turn_servers.extend(turn_servers_from_parts(
            urls.as_deref(),
            username.as_deref(),
            password.as_deref(),
        ));
        self
    }
}

/// Build TURN entries from a comma-separated URL list and shared credentials
///
/// Returns nothing unless URLs, username and password are all present.
pub fn turn_servers_from_parts(
    urls: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
) -> Vec<TurnServerConfig> {
    let (Some(urls), Some(username), Some(password)) = (urls, username, password) else {
        return Vec::new();
    };

    urls.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| TurnServerConfig {
            url: url.to_string(),
            username: username.to_string(),
            credential: password.to_string(),
        })
        .collect()
}
