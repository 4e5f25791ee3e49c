//! Binary wire frames
//!
//! A binary frame begins with a one-byte kind. Audio chunks (`0x04`) carry
//! a big-endian unsigned 64-bit server timestamp in microseconds followed
//! by the encoded audio payload. Auxiliary frames (`0x08`) carry artwork or
//! future extensions and are accepted and discarded. Unknown kinds are
//! surfaced so the caller can log and drop them without closing the
//! connection.

use crate::{Error, Result};

/// Frame kind byte for audio chunks
pub const KIND_AUDIO_CHUNK: u8 = 0x04;

/// Frame kind byte for auxiliary binary payloads
pub const KIND_AUXILIARY: u8 = 0x08;

/// Minimum length of an audio frame: kind byte plus 8-byte timestamp
pub const AUDIO_HEADER_LEN: usize = 9;

/// A parsed binary frame, borrowing the payload from the wire buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame<'a> {
    /// Timestamped encoded audio
    AudioChunk {
        /// Server monotonic-loop timestamp in microseconds
        server_timestamp_us: u64,
        /// Encoded audio payload (may be empty)
        payload: &'a [u8],
    },
    /// Artwork or future extension payload
    Auxiliary {
        /// Opaque payload
        payload: &'a [u8],
    },
    /// Unrecognized kind byte
    Unknown {
        /// The kind byte observed on the wire
        kind: u8,
    },
}

/// Parse a binary frame received from the server
///
/// An audio frame shorter than [`AUDIO_HEADER_LEN`] bytes fails with
/// [`Error::MalformedFrame`]; the connection stays up and the frame is
/// dropped by the caller.
pub fn parse_binary_frame(frame: &[u8]) -> Result<BinaryFrame<'_>> {
    let kind = *frame
        .first()
        .ok_or_else(|| Error::MalformedFrame("empty binary frame".into()))?;

    match kind {
        KIND_AUDIO_CHUNK => {
            if frame.len() < AUDIO_HEADER_LEN {
                return Err(Error::MalformedFrame(format!(
                    "audio frame of {} bytes, need at least {}",
                    frame.len(),
                    AUDIO_HEADER_LEN
                )));
            }

            let mut ts = [0u8; 8];
            ts.copy_from_slice(&frame[1..AUDIO_HEADER_LEN]);

            Ok(BinaryFrame::AudioChunk {
                server_timestamp_us: u64::from_be_bytes(ts),
                payload: &frame[AUDIO_HEADER_LEN..],
            })
        }
        KIND_AUXILIARY => Ok(BinaryFrame::Auxiliary {
            payload: &frame[1..],
        }),
        other => Ok(BinaryFrame::Unknown { kind: other }),
    }
}

/// Encode an audio chunk frame
///
/// The player never sends binary frames; this exists for servers and test
/// harnesses that feed the player.
pub fn encode_audio_chunk(server_timestamp_us: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(AUDIO_HEADER_LEN + payload.len());
    frame.push(KIND_AUDIO_CHUNK);
    frame.extend_from_slice(&server_timestamp_us.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
