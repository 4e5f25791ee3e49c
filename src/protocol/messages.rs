//! JSON text message types
//!
//! Every text frame is a `{type, payload}` object. Outbound messages are a
//! tagged enum serialized straight into that envelope. Inbound messages are
//! parsed envelope-first and then matched on the type string so an unknown
//! type degrades to a logged drop instead of a failed deserialization.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Protocol version announced in `client/hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Roles this player announces to the server
pub const SUPPORTED_ROLES: [&str; 4] = ["player@v1", "metadata@v1", "artwork@v1", "visualizer@v1"];

// ---------------------------------------------------------------------------
// Outbound (client → server)
// ---------------------------------------------------------------------------

/// Outbound client message, serialized as `{type, payload}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Session handshake with identity and capabilities
    #[serde(rename = "client/hello")]
    Hello(ClientHello),

    /// Time-sync request
    #[serde(rename = "client/time")]
    Time(ClientTime),

    /// Player state report (also echoed after server commands)
    #[serde(rename = "client/state")]
    State(ClientState),

    /// Clean-shutdown notice, sent strictly before socket close
    #[serde(rename = "client/goodbye")]
    Goodbye(ClientGoodbye),
}

impl ClientMessage {
    /// Serialize to the wire representation
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `client/hello` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientHello {
    /// Persistent opaque client identifier
    pub client_id: String,
    /// Human-readable player name
    pub name: String,
    /// Protocol version
    pub version: u32,
    /// Roles this client implements
    pub supported_roles: Vec<String>,
    /// Device description
    pub device_info: DeviceInfo,

    /// Player capability descriptor
    #[serde(rename = "player@v1_support")]
    pub player_v1_support: PlayerSupport,
    /// Artwork capability descriptor
    #[serde(rename = "artwork@v1_support")]
    pub artwork_v1_support: ArtworkSupport,
    /// Visualizer capability descriptor
    #[serde(rename = "visualizer@v1_support")]
    pub visualizer_v1_support: VisualizerSupport,

    // Unversioned duplicates kept for servers that predate the versioned
    // role descriptors.
    /// Legacy duplicate of `player@v1_support`
    pub player_support: PlayerSupport,
    /// Legacy metadata capability flag
    pub metadata_support: MetadataSupport,
    /// Legacy duplicate of `artwork@v1_support`
    pub artwork_support: ArtworkSupport,
    /// Legacy duplicate of `visualizer@v1_support`
    pub visualizer_support: VisualizerSupport,
}

/// Device description carried in `client/hello`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    /// Product name shown in server UIs
    pub product_name: String,
    /// Manufacturer string
    pub manufacturer: String,
    /// Software version of this player
    pub software_version: String,
}

/// Player capability descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSupport {
    /// Accepted stream formats, highest quality first
    pub supported_formats: Vec<FormatSpec>,
    /// Receive buffer capacity in bytes
    pub buffer_capacity: u64,
    /// Commands the player accepts via `server/command`
    pub supported_commands: Vec<String>,
    /// Accepted codec names
    pub support_codecs: Vec<String>,
    /// Accepted channel counts
    pub support_channels: Vec<u8>,
    /// Accepted sample rates in Hz
    pub support_sample_rates: Vec<u32>,
    /// Accepted bit depths
    pub support_bit_depth: Vec<u8>,
}

/// One entry of the supported-format priority list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatSpec {
    /// Codec name
    pub codec: Codec,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Bits per sample
    pub bit_depth: u8,
}

/// Artwork capability descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtworkSupport {
    /// Accepted artwork encodings
    pub supported_formats: Vec<String>,
}

/// Visualizer capability descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizerSupport {
    /// Whether visualizer data is accepted
    pub supported: bool,
}

/// Legacy metadata capability flag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataSupport {
    /// Whether metadata updates are accepted
    pub supported: bool,
}

/// `client/time` payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTime {
    /// Client wall-clock at transmission, Unix microseconds
    pub client_transmitted: u64,
}

/// `client/state` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientState {
    /// Player transport state
    pub player: PlayerState,
}

/// Player state block inside `client/state`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    /// Sync status, `"synchronized"` once the handshake completes
    pub state: String,
    /// Current volume, 0..=100
    pub volume: u8,
    /// Current mute flag
    pub muted: bool,
}

/// `client/goodbye` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientGoodbye {
    /// Reason for leaving, e.g. `"shutdown"`
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Inbound (server → client)
// ---------------------------------------------------------------------------

/// Parsed inbound server message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake acknowledgement
    Hello(ServerHello),
    /// Time-sync response
    Time(ServerTime),
    /// Metadata and/or controller state update
    State(ServerState),
    /// Player command (volume, mute)
    Command(ServerCommand),
    /// Stream format announcement, audio follows
    StreamStart(StreamStart),
    /// Stream teardown
    StreamEnd,
    /// Stream flush (seek)
    StreamClear,
    /// Group-level transport state update
    GroupUpdate(TransportUpdate),
    /// Session-level transport state update
    SessionUpdate(TransportUpdate),
}

/// `server/hello` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerHello {
    /// Server identifier
    pub server_id: String,
    /// Server display name
    #[serde(default)]
    pub name: Option<String>,
    /// Protocol version the server speaks
    #[serde(default)]
    pub version: Option<u32>,
    /// Roles the server activated for this client
    #[serde(default)]
    pub active_roles: Vec<String>,
}

/// `server/time` payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTime {
    /// Echo of the client's transmit timestamp (t1)
    pub client_transmitted: u64,
    /// Server loop time at receipt (t2)
    pub server_received: u64,
    /// Server loop time at reply (t3)
    pub server_transmitted: u64,
}

/// `server/state` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerState {
    /// Track metadata, absent when unchanged
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Controller transport state, absent when unchanged
    #[serde(default)]
    pub controller: Option<ControllerState>,
}

/// Controller block inside `server/state`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ControllerState {
    /// Transport state reported by the controller
    #[serde(default)]
    pub playback_state: Option<PlaybackState>,
}

/// `server/command` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerCommand {
    /// Player-directed command block
    pub player: PlayerCommand,
}

/// Command block inside `server/command`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerCommand {
    /// Command name, `"volume"` or `"mute"`
    pub command: String,
    /// New volume for the volume command
    #[serde(default)]
    pub volume: Option<u8>,
    /// New mute flag for the mute command
    #[serde(default)]
    pub mute: Option<bool>,
}

/// `stream/start` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStart {
    /// Format of the stream about to flow
    pub player: StreamFormat,
}

/// Stream format descriptor, created on `stream/start` and cleared on
/// `stream/end`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFormat {
    /// Audio codec of the chunks
    pub codec: Codec,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Bits per sample
    pub bit_depth: u8,
    /// Codec-specific initialization blob, base64 when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

/// Audio codecs understood on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Raw PCM, decoding is the identity
    Pcm,
    /// Opus at 48 kHz
    Opus,
    /// FLAC
    Flac,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Pcm => write!(f, "pcm"),
            Codec::Opus => write!(f, "opus"),
            Codec::Flac => write!(f, "flac"),
        }
    }
}

/// `group/update` and `session/update` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransportUpdate {
    /// Transport state for the player's group or session
    #[serde(default)]
    pub playback_state: Option<PlaybackState>,
}

/// Server-reported transport state mirrored by the player
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Audio is flowing
    Playing,
    /// Transport paused; scheduled chunks keep accumulating
    Paused,
    /// No session transport state yet
    Idle,
    /// Transport stopped
    Stopped,
}

/// Current track metadata; `None` fields mean unknown or unchanged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Metadata {
    /// Track title
    #[serde(default)]
    pub title: Option<String>,
    /// Track artist
    #[serde(default)]
    pub artist: Option<String>,
    /// Album name
    #[serde(default)]
    pub album: Option<String>,
    /// Album artist
    #[serde(default)]
    pub album_artist: Option<String>,
    /// Artwork URL
    #[serde(default)]
    pub artwork_url: Option<String>,
    /// Release year
    #[serde(default)]
    pub year: Option<i32>,
    /// Track number
    #[serde(default)]
    pub track: Option<u32>,
    /// Playback position in seconds
    #[serde(default)]
    pub position: Option<f64>,
    /// Track duration in seconds
    #[serde(default)]
    pub duration: Option<f64>,
    /// Repeat flag
    #[serde(default)]
    pub repeat: Option<bool>,
    /// Shuffle flag
    #[serde(default)]
    pub shuffle: Option<bool>,
}

/// Raw `{type, payload}` envelope used for inbound dispatch
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Parse an inbound text frame into a typed server message
///
/// Returns [`Error::UnknownMessageType`] for type strings this player does
/// not recognize; the caller logs and drops those.
pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;

    let msg = match envelope.kind.as_str() {
        "server/hello" => ServerMessage::Hello(serde_json::from_value(envelope.payload)?),
        "server/time" => ServerMessage::Time(serde_json::from_value(envelope.payload)?),
        "server/state" => ServerMessage::State(serde_json::from_value(envelope.payload)?),
        "server/command" => ServerMessage::Command(serde_json::from_value(envelope.payload)?),
        "stream/start" => ServerMessage::StreamStart(serde_json::from_value(envelope.payload)?),
        "stream/end" => ServerMessage::StreamEnd,
        "stream/clear" => ServerMessage::StreamClear,
        "group/update" => ServerMessage::GroupUpdate(serde_json::from_value(envelope.payload)?),
        "session/update" => ServerMessage::SessionUpdate(serde_json::from_value(envelope.payload)?),
        other => return Err(Error::UnknownMessageType(other.to_string())),
    };

    Ok(msg)
}
