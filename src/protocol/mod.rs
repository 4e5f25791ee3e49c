//! Wire protocol for the Sendspin WebSocket session
//!
//! Text frames carry JSON messages in a `{type, payload}` envelope; binary
//! frames carry typed payloads distinguished by a one-byte kind. The player
//! only ever sends text frames.

pub mod frame;
pub mod messages;

pub use frame::{parse_binary_frame, BinaryFrame};
pub use messages::{
    parse_server_message, ClientHello, ClientMessage, ClientState, ClientTime, Codec, Metadata,
    PlaybackState, PlayerCommand, PlayerState, ServerHello, ServerMessage, ServerTime,
    StreamFormat,
};
