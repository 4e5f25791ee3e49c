//! Sendspin player CLI
//!
//! Runs a player endpoint against a configured or discovered server,
//! logging observer events. Audio goes to a null sink, which makes this a
//! protocol smoke-tester; embedders supply a real sink.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;

use sendspin_player::{
    MdnsDiscovery, NullSink, PcmDecoder, Player, PlayerConfig, PlayerEvent,
};

#[derive(Debug, Parser)]
#[command(name = "sendspin-player", about = "Sendspin player endpoint", version)]
struct Args {
    /// Server address as host:port; omit to discover via mDNS
    #[arg(long)]
    server: Option<String>,

    /// Player name announced to the server (defaults to the host name)
    #[arg(long)]
    name: Option<String>,

    /// Jitter buffer depth in milliseconds
    #[arg(long, default_value_t = 11_000)]
    buffer_ms: u64,

    /// Initial volume, 0..=100
    #[arg(long, default_value_t = 100)]
    volume: u8,

    /// Discovery timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    discovery_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    sendspin_player::init()?;

    let args = Args::parse();

    let mut config = PlayerConfig::default();
    config.server_addr = args.server;
    config.buffer_ms = args.buffer_ms;
    config.initial_volume = args.volume;
    config.discovery_timeout_ms = args.discovery_timeout_ms;
    if let Some(name) = args.name {
        config.player_name = name;
    }

    tracing::info!(
        player = %config.player_name,
        server = config.server_addr.as_deref().unwrap_or("<discover>"),
        buffer_ms = config.buffer_ms,
        "starting player"
    );

    let discovery = Arc::new(MdnsDiscovery::new(
        &config.player_name,
        &config.client_id,
        config.advertise_port,
    )?);

    let player = Player::new(
        config,
        Arc::new(observe),
        discovery,
        Box::new(PcmDecoder::new()),
        Arc::new(NullSink::new()),
    )?;

    player.start().await?;

    signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let stats = player.stats();
    player.stop().await;
    tracing::info!(
        received = stats.stats.received,
        played = stats.stats.played,
        dropped = stats.stats.dropped,
        "final scheduler statistics"
    );

    Ok(())
}

fn observe(event: PlayerEvent) {
    match event {
        PlayerEvent::AudioChunk { .. } => {} // too chatty for the log
        PlayerEvent::StreamStarted(format) => {
            tracing::info!(
                codec = %format.codec,
                sample_rate = format.sample_rate,
                "stream started"
            );
        }
        PlayerEvent::StreamEnded => tracing::info!("stream ended"),
        PlayerEvent::StreamCleared => tracing::info!("stream cleared"),
        PlayerEvent::MetadataChanged(metadata) => {
            tracing::info!(
                title = metadata.title.as_deref().unwrap_or("?"),
                artist = metadata.artist.as_deref().unwrap_or("?"),
                "now playing"
            );
        }
        PlayerEvent::PlaybackStateChanged(state) => {
            tracing::info!(?state, "playback state");
        }
        PlayerEvent::ConnectionStateChanged { connected } => {
            tracing::info!(connected, "connection state");
        }
    }
}
