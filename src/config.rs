//! Player configuration
//!
//! Configuration consumed by the supervisor: server address (literal or
//! discovered), player identity, jitter buffer depth, initial volume state,
//! and discovery parameters.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default jitter buffer depth in milliseconds
pub const DEFAULT_BUFFER_MS: u64 = 11_000;

/// Default discovery timeout in milliseconds
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Default mDNS advertise port
pub const DEFAULT_ADVERTISE_PORT: u16 = 8927;

/// Player endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Literal "host:port" of the server; when None the server is located
    /// via mDNS discovery and rediscovered on reconnect
    pub server_addr: Option<String>,

    /// Human-readable player name, typically the host name
    pub player_name: String,

    /// Jitter buffer depth in milliseconds (default 11000)
    pub buffer_ms: u64,

    /// Initial volume, 0..=100 (default 100)
    pub initial_volume: u8,

    /// Initial mute state (default false)
    pub initial_muted: bool,

    /// Discovery timeout in milliseconds (default 10000)
    pub discovery_timeout_ms: u64,

    /// Port announced in the player's own mDNS advertisement (default 8927)
    pub advertise_port: u16,

    /// Persistent opaque 128-bit client identifier, generated once at first
    /// run and kept across restarts by the host's configuration store
    pub client_id: String,

    /// Whether to reconnect after an unexpected disconnect (default true).
    /// With reconnect disabled, a connect timeout at start propagates to
    /// the caller instead of scheduling a retry.
    pub reconnect: bool,
}

impl PlayerConfig {
    /// Create a configuration with the given client identity and defaults
    /// for everything else
    pub fn new(player_name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            server_addr: None,
            player_name: player_name.into(),
            buffer_ms: DEFAULT_BUFFER_MS,
            initial_volume: 100,
            initial_muted: false,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            advertise_port: DEFAULT_ADVERTISE_PORT,
            client_id: client_id.into(),
            reconnect: true,
        }
    }

    /// Mint a fresh opaque client identifier
    ///
    /// The host is expected to persist the returned value and pass it back
    /// on every subsequent run so the server recognizes the player.
    pub fn generate_client_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.player_name.is_empty() {
            return Err(Error::InvalidConfig("player_name must not be empty".into()));
        }

        if self.client_id.is_empty() {
            return Err(Error::InvalidConfig("client_id must not be empty".into()));
        }

        if self.buffer_ms == 0 {
            return Err(Error::InvalidConfig("buffer_ms must be > 0".into()));
        }

        if self.initial_volume > 100 {
            return Err(Error::InvalidConfig(format!(
                "initial_volume ({}) must be <= 100",
                self.initial_volume
            )));
        }

        if let Some(addr) = &self.server_addr {
            parse_host_port(addr)?;
        }

        Ok(())
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let host = gethostname::gethostname().to_string_lossy().to_string();
        Self::new(host, Self::generate_client_id())
    }
}

/// Split a "host:port" string, validating the port
pub fn parse_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("server_addr '{}' is not host:port", addr)))?;

    if host.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "server_addr '{}' has an empty host",
            addr
        )));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("server_addr '{}' has an invalid port", addr)))?;

    Ok((host, port))
}
