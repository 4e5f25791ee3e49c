//! Audio sink seam
//!
//! The sink renders decoded PCM to the host's audio output, typically a
//! local HTTP stream into the host's media player. The scheduler invokes
//! `play` on the release path and bounds it with a short drain wait, so a
//! slow sink translates into dropped chunks rather than a stalled pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::protocol::StreamFormat;
use crate::Result;

/// Playback output consumed by the scheduler
///
/// Implementations must be Send + Sync; `play` may block briefly but the
/// caller enforces the drain bound.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Prepare the output for a stream of the given format
    async fn start(&self, format: &StreamFormat) -> Result<()>;

    /// Render one decoded PCM buffer
    async fn play(&self, pcm: &[u8]) -> Result<()>;

    /// Discard any internally buffered audio (seek)
    async fn clear_buffer(&self);

    /// Tear the output down
    async fn stop(&self);

    /// Whether the output is currently accepting audio
    fn is_active(&self) -> bool;
}

/// Sink that discards audio while tracking activity
///
/// Used by the CLI for protocol smoke-testing and by tests that only care
/// about scheduling behavior.
#[derive(Debug, Default)]
pub struct NullSink {
    active: AtomicBool,
    played: AtomicU64,
    cleared: AtomicU64,
}

impl NullSink {
    /// Create an inactive null sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers played since creation
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    /// Number of clear_buffer calls since creation
    pub fn cleared(&self) -> u64 {
        self.cleared.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AudioSink for NullSink {
    async fn start(&self, _format: &StreamFormat) -> Result<()> {
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn play(&self, _pcm: &[u8]) -> Result<()> {
        self.played.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear_buffer(&self) {
        self.cleared.fetch_add(1, Ordering::Relaxed);
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Codec;

    fn pcm_format() -> StreamFormat {
        StreamFormat {
            codec: Codec::Pcm,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: None,
        }
    }

    #[tokio::test]
    async fn test_null_sink_lifecycle() {
        let sink = NullSink::new();
        assert!(!sink.is_active());

        sink.start(&pcm_format()).await.unwrap();
        assert!(sink.is_active());

        sink.play(&[0u8; 4]).await.unwrap();
        sink.play(&[0u8; 4]).await.unwrap();
        assert_eq!(sink.played(), 2);

        sink.clear_buffer().await;
        assert_eq!(sink.cleared(), 1);

        sink.stop().await;
        assert!(!sink.is_active());
    }
}
