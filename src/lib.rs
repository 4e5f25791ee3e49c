//! Sendspin player endpoint
//!
//! A receive-only participant in the Sendspin synchronized multi-room
//! audio protocol: it locates or connects to a server, negotiates a
//! session over WebSocket, synchronizes its clock with the server's
//! monotonic loop timeline, and renders timestamped audio chunks so every
//! cooperating player on the network produces the same sample at the same
//! wall-clock instant.
//!
//! # Architecture
//!
//! The [`Player`] supervisor owns the receive pipeline:
//! - [`connection`] manages the socket, connect timeout and reconnect
//!   backoff,
//! - [`session`] drives the handshake, sync exchanges, stream lifecycle
//!   and server commands,
//! - [`sync`] maps server loop time onto local Unix microseconds,
//! - [`scheduler`] buffers decoded chunks and releases them at their play
//!   instants.
//!
//! External collaborators plug in behind traits: [`discovery::Discovery`]
//! locates servers (an mDNS implementation ships here),
//! [`decoder::AudioDecoder`] turns encoded chunks into PCM (PCM
//! pass-through ships here; Opus/FLAC are host-provided), and
//! [`sink::AudioSink`] renders PCM to the host's output.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sendspin_player::{
//!     MdnsDiscovery, NullSink, PcmDecoder, Player, PlayerConfig, PlayerEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> sendspin_player::Result<()> {
//!     sendspin_player::init()?;
//!
//!     let config = PlayerConfig::default();
//!     let discovery = Arc::new(MdnsDiscovery::new(
//!         &config.player_name,
//!         &config.client_id,
//!         config.advertise_port,
//!     )?);
//!
//!     let player = Player::new(
//!         config,
//!         Arc::new(|event: PlayerEvent| tracing::info!(?event, "player event")),
//!         discovery,
//!         Box::new(PcmDecoder::new()),
//!         Arc::new(NullSink::new()),
//!     )?;
//!
//!     player.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     player.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod decoder;
pub mod discovery;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod sync;
pub mod time;

mod error;
pub use error::{Error, Result};

pub use config::PlayerConfig;
pub use decoder::{AudioDecoder, PcmDecoder};
pub use discovery::{Discovery, MdnsDiscovery};
pub use protocol::{Codec, Metadata, PlaybackState, StreamFormat};
pub use scheduler::{SchedulerSnapshot, SchedulerStats};
pub use sink::{AudioSink, NullSink};
pub use supervisor::{Player, PlayerEvent, PlayerObserver};

/// Initialize logging for binaries embedding the player
///
/// Installs a `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info`. Library users with their own subscriber skip this.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("sendspin player initialized");
    Ok(())
}
