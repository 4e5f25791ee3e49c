//! Error types for the player endpoint

use thiserror::Error;

/// Result type alias for player operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for player operations
///
/// Transport errors feed the reconnect policy; wire-level and per-chunk
/// errors are logged and recovered locally. Only a connect timeout at
/// initial start with reconnect disabled ever propagates out of the core.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect attempt did not complete within the connect timeout
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Socket closed by the peer or by shutdown
    #[error("socket closed: {0}")]
    SocketClosed(String),

    /// Transport-level socket failure
    #[error("socket error: {0}")]
    SocketError(String),

    /// Binary frame too short or otherwise unparseable
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Text message with an unrecognized type field
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Time response whose client_transmitted is not pending
    #[error("stale sync response (client_transmitted {0})")]
    StaleSyncResponse(u64),

    /// Decoder did not return within the per-chunk deadline
    #[error("decode timed out after {0} ms")]
    DecodeTimeout(u64),

    /// Decoder rejected the chunk
    #[error("decode failed: {0}")]
    DecodeFailure(String),

    /// Scheduler queue at capacity, newest chunk dropped
    #[error("scheduler queue full ({0} chunks)")]
    SchedulerQueueFull(usize),

    /// Chunk arrived past the late window
    #[error("chunk too late by {0} us")]
    ChunkTooLate(i64),

    /// Clock synchronization with the server was lost
    #[error("clock sync lost")]
    SyncLost,

    /// Discovery yielded no server within the timeout
    #[error("discovery timed out after {0} ms")]
    DiscoveryTimeout(u64),

    /// mDNS discovery failure
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Audio sink failure
    #[error("audio sink error: {0}")]
    Sink(String),

    /// Configuration validation failure
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// start() called on a player that is already running
    #[error("player already started")]
    AlreadyStarted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
