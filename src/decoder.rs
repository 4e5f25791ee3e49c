//! Audio decoder seam
//!
//! The supervisor decodes chunks before scheduling them, so the scheduler
//! stays codec-agnostic and decode backpressure lands on the ingress path.
//! Opus and FLAC decoders are supplied by the host; PCM pass-through ships
//! here because decoding it is the identity on bytes.

use async_trait::async_trait;

use crate::protocol::{Codec, StreamFormat};
use crate::{Error, Result};

/// Chunk decoder consumed by the supervisor
///
/// The supervisor bounds `decode` with a one-second timeout; an
/// implementation that overruns it only costs the chunk in flight.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    /// Prepare for a stream of the given format
    async fn initialize(&mut self, format: &StreamFormat) -> Result<()>;

    /// Decode one encoded chunk into interleaved PCM bytes
    async fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>>;

    /// Release any codec state
    async fn cleanup(&mut self);
}

/// Pass-through decoder for PCM streams
#[derive(Debug, Default)]
pub struct PcmDecoder {
    initialized: bool,
}

impl PcmDecoder {
    /// Create a decoder that accepts PCM streams only
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioDecoder for PcmDecoder {
    async fn initialize(&mut self, format: &StreamFormat) -> Result<()> {
        if format.codec != Codec::Pcm {
            return Err(Error::DecodeFailure(format!(
                "pcm decoder cannot handle {} streams",
                format.codec
            )));
        }

        self.initialized = true;
        Ok(())
    }

    async fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>> {
        if !self.initialized {
            return Err(Error::DecodeFailure("decoder not initialized".into()));
        }

        Ok(encoded.to_vec())
    }

    async fn cleanup(&mut self) {
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(codec: Codec) -> StreamFormat {
        StreamFormat {
            codec,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: None,
        }
    }

    #[tokio::test]
    async fn test_pcm_decode_is_identity() {
        let mut decoder = PcmDecoder::new();
        decoder.initialize(&format(Codec::Pcm)).await.unwrap();

        let chunk = vec![1u8, 2, 3, 4, 5];
        let decoded = decoder.decode(&chunk).await.unwrap();
        assert_eq!(decoded, chunk);
    }

    #[tokio::test]
    async fn test_pcm_decoder_rejects_other_codecs() {
        let mut decoder = PcmDecoder::new();
        assert!(decoder.initialize(&format(Codec::Opus)).await.is_err());
    }

    #[tokio::test]
    async fn test_decode_before_initialize_fails() {
        let mut decoder = PcmDecoder::new();
        assert!(decoder.decode(&[0u8; 4]).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_resets_state() {
        let mut decoder = PcmDecoder::new();
        decoder.initialize(&format(Codec::Pcm)).await.unwrap();
        decoder.cleanup().await;
        assert!(decoder.decode(&[0u8; 4]).await.is_err());
    }
}
