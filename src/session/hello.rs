//! `client/hello` capability payload
//!
//! Declares the player's identity, roles and accepted formats. Formats are
//! listed highest quality first so the server picks the best stream the
//! player can take; Opus trails the PCM ladder.

use crate::config::PlayerConfig;
use crate::protocol::messages::{
    ArtworkSupport, ClientHello, Codec, DeviceInfo, FormatSpec, MetadataSupport, PlayerSupport,
    VisualizerSupport, PROTOCOL_VERSION, SUPPORTED_ROLES,
};

/// Receive buffer capacity declared to the server, bytes
pub const BUFFER_CAPACITY_BYTES: u64 = 1_048_576;

/// Commands accepted via `server/command`
pub const SUPPORTED_COMMANDS: [&str; 2] = ["volume", "mute"];

/// Build the handshake payload for this player
pub fn build_client_hello(config: &PlayerConfig) -> ClientHello {
    let player_support = build_player_support();
    let artwork_support = ArtworkSupport {
        supported_formats: vec!["jpeg".into(), "png".into()],
    };
    let visualizer_support = VisualizerSupport { supported: true };

    ClientHello {
        client_id: config.client_id.clone(),
        name: config.player_name.clone(),
        version: PROTOCOL_VERSION,
        supported_roles: SUPPORTED_ROLES.iter().map(|r| r.to_string()).collect(),
        device_info: DeviceInfo {
            product_name: "Sendspin Player".into(),
            manufacturer: "sendspin-player".into(),
            software_version: env!("CARGO_PKG_VERSION").into(),
        },
        player_v1_support: player_support.clone(),
        artwork_v1_support: artwork_support.clone(),
        visualizer_v1_support: visualizer_support.clone(),
        player_support,
        metadata_support: MetadataSupport { supported: true },
        artwork_support,
        visualizer_support,
    }
}

fn build_player_support() -> PlayerSupport {
    let pcm = |sample_rate: u32, bit_depth: u8| FormatSpec {
        codec: Codec::Pcm,
        sample_rate,
        channels: 2,
        bit_depth,
    };

    PlayerSupport {
        supported_formats: vec![
            pcm(192_000, 24),
            pcm(176_400, 24),
            pcm(96_000, 24),
            pcm(88_200, 24),
            pcm(48_000, 16),
            pcm(44_100, 16),
            FormatSpec {
                codec: Codec::Opus,
                sample_rate: 48_000,
                channels: 2,
                bit_depth: 16,
            },
        ],
        buffer_capacity: BUFFER_CAPACITY_BYTES,
        supported_commands: SUPPORTED_COMMANDS.iter().map(|c| c.to_string()).collect(),
        support_codecs: vec!["pcm".into(), "opus".into()],
        support_channels: vec![2, 1],
        support_sample_rates: vec![192_000, 176_400, 96_000, 88_200, 48_000, 44_100],
        support_bit_depth: vec![24, 16],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientMessage;

    fn hello_json() -> serde_json::Value {
        let config = PlayerConfig::new("kitchen", "client-1");
        let msg = ClientMessage::Hello(build_client_hello(&config));
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_hello_identity_and_roles() {
        let value = hello_json();
        let payload = &value["payload"];

        assert_eq!(value["type"], "client/hello");
        assert_eq!(payload["client_id"], "client-1");
        assert_eq!(payload["name"], "kitchen");
        assert_eq!(payload["version"], 1);

        let roles: Vec<&str> = payload["supported_roles"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap())
            .collect();
        assert!(roles.contains(&"player@v1"));
        assert!(roles.contains(&"metadata@v1"));
    }

    #[test]
    fn test_hello_carries_versioned_and_legacy_descriptors() {
        let value = hello_json();
        let payload = &value["payload"];

        assert!(payload.get("player@v1_support").is_some());
        assert!(payload.get("artwork@v1_support").is_some());
        assert!(payload.get("visualizer@v1_support").is_some());

        // legacy duplicates for older servers
        assert!(payload.get("player_support").is_some());
        assert!(payload.get("metadata_support").is_some());
        assert!(payload.get("artwork_support").is_some());
        assert!(payload.get("visualizer_support").is_some());

        assert_eq!(payload["player@v1_support"], payload["player_support"]);
    }

    #[test]
    fn test_hello_format_priority() {
        let value = hello_json();
        let formats = value["payload"]["player@v1_support"]["supported_formats"]
            .as_array()
            .unwrap()
            .clone();

        assert_eq!(formats.len(), 7);
        assert_eq!(formats[0]["codec"], "pcm");
        assert_eq!(formats[0]["sample_rate"], 192_000);
        assert_eq!(formats[0]["bit_depth"], 24);
        assert_eq!(formats[6]["codec"], "opus");
        assert_eq!(formats[6]["sample_rate"], 48_000);
    }

    #[test]
    fn test_hello_player_capabilities() {
        let value = hello_json();
        let support = &value["payload"]["player@v1_support"];

        assert_eq!(support["buffer_capacity"], 1_048_576);
        assert_eq!(support["supported_commands"][0], "volume");
        assert_eq!(support["supported_commands"][1], "mute");
    }
}
