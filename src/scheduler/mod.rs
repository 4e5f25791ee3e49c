//! Jitter-buffered playback scheduler
//!
//! Decoded PCM buffers are queued in a min-heap keyed by their play
//! instant and released to the audio sink by a 10 ms tick. A startup
//! buffering phase absorbs arrival jitter before the first release, a
//! ±50 ms window drops chunks that arrive or surface too late, and a 1 s
//! watchdog flushes and re-buffers when playback wedges.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sink::AudioSink;
use crate::sync::{ClockQuality, SharedClock};
use crate::time::now_unix_us;
use crate::{Error, Result};

/// Fixed chunk duration; must match the server
pub const CHUNK_DURATION_MS: u64 = 20;

/// Release loop period
pub const RELEASE_TICK_MS: u64 = 10;

/// Watchdog period
pub const WATCHDOG_TICK_MS: u64 = 1_000;

/// Chunks later than this at ingress or release are dropped
pub const LATE_WINDOW_US: i64 = 50_000;

/// Chunks earlier than this stay queued for a later tick
pub const EARLY_WINDOW_US: i64 = 50_000;

/// Hard ceiling on the queue regardless of buffer depth
pub const MAX_QUEUE_CHUNKS_CAP: usize = 600;

/// Queue headroom above the buffering target
pub const QUEUE_HEADROOM_CHUNKS: usize = 50;

/// Bound on the sink's per-chunk drain wait
pub const SINK_DRAIN_TIMEOUT_MS: u64 = 100;

/// Buffering longer than this is force-exited by the watchdog
const BUFFERING_TIMEOUT_US: u64 = 5_000_000;

/// Chunks arriving but nothing released for this long triggers recovery
const STALL_US: u64 = 3_000_000;

/// Queue stuck above [`STUCK_QUEUE_MIN`] for this long triggers recovery
const STUCK_QUEUE_US: u64 = 5_000_000;

/// Minimum queue depth for the stuck-queue recovery trigger
const STUCK_QUEUE_MIN: usize = 10;

/// Consecutive late drops that, with a lost clock, trigger recovery
const LOST_CLOCK_DROP_THRESHOLD: u32 = 20;

/// Callback invoked with each released PCM buffer, after the sink
pub type ChunkCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Derived queue sizing for a given buffer depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerParams {
    /// Chunks to accumulate before the first release
    pub buffer_target_chunks: usize,
    /// Queue capacity; the newest chunk is dropped beyond this
    pub max_queue_chunks: usize,
}

impl SchedulerParams {
    /// Derive sizing from the configured buffer depth in milliseconds
    pub fn from_buffer_ms(buffer_ms: u64) -> Self {
        let buffer_target_chunks = ((buffer_ms / CHUNK_DURATION_MS).max(1)) as usize;
        let max_queue_chunks =
            (buffer_target_chunks + QUEUE_HEADROOM_CHUNKS).min(MAX_QUEUE_CHUNKS_CAP);

        Self {
            buffer_target_chunks,
            max_queue_chunks,
        }
    }
}

/// A decoded buffer waiting for its play instant
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    /// Wall-clock instant at which to release, Unix microseconds
    pub play_at_unix_us: u64,
    /// Decoded interleaved PCM bytes
    pub pcm: Vec<u8>,
    /// The server timestamp the play instant was derived from
    pub server_timestamp_us: u64,
}

impl PartialEq for ScheduledBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.play_at_unix_us == other.play_at_unix_us
            && self.server_timestamp_us == other.server_timestamp_us
    }
}

impl Eq for ScheduledBuffer {}

impl PartialOrd for ScheduledBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledBuffer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.play_at_unix_us
            .cmp(&other.play_at_unix_us)
            .then(self.server_timestamp_us.cmp(&other.server_timestamp_us))
    }
}

/// Lifetime counters for one scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Chunks offered to the scheduler, including ones it dropped
    pub received: u64,
    /// Chunks released to the sink
    pub played: u64,
    /// Chunks dropped at ingress, at release, or by a flush
    pub dropped: u64,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Lifetime counters
    pub stats: SchedulerStats,
    /// Current queue depth
    pub queue_len: usize,
    /// Whether the startup/recovery buffering phase is active
    pub buffering: bool,
}

/// Lock-free mirror of the scheduler counters
///
/// Survives scheduler teardown so hosts can read stats across stream
/// restarts without reaching into the session task.
#[derive(Debug, Default)]
pub struct StatsCell {
    received: AtomicU64,
    played: AtomicU64,
    dropped: AtomicU64,
    queue_len: AtomicU64,
    buffering: AtomicBool,
}

impl StatsCell {
    /// Read the last published snapshot
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            stats: SchedulerStats {
                received: self.received.load(Ordering::Relaxed),
                played: self.played.load(Ordering::Relaxed),
                dropped: self.dropped.load(Ordering::Relaxed),
            },
            queue_len: self.queue_len.load(Ordering::Relaxed) as usize,
            buffering: self.buffering.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.received.store(inner.stats.received, Ordering::Relaxed);
        self.played.store(inner.stats.played, Ordering::Relaxed);
        self.dropped.store(inner.stats.dropped, Ordering::Relaxed);
        self.queue_len
            .store(inner.heap.len() as u64, Ordering::Relaxed);
        self.buffering.store(inner.buffering, Ordering::Relaxed);
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<ScheduledBuffer>>,
    buffering: bool,
    buffering_since_us: u64,
    last_play_unix_us: Option<u64>,
    last_enqueue_unix_us: Option<u64>,
    /// Watchdog stall baseline: creation, buffering exit, recovery or the
    /// most recent release, whichever came last
    last_progress_us: u64,
    consecutive_drops: u32,
    stats: SchedulerStats,
}

/// Priority-queue playback scheduler with startup buffering and a watchdog
pub struct JitterScheduler {
    inner: Arc<Mutex<Inner>>,
    clock: SharedClock,
    params: SchedulerParams,
    stats_cell: Arc<StatsCell>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JitterScheduler {
    /// Create a scheduler in the buffering state
    pub fn new(buffer_ms: u64, clock: SharedClock, stats_cell: Arc<StatsCell>) -> Self {
        let params = SchedulerParams::from_buffer_ms(buffer_ms);
        let now = now_unix_us();

        let inner = Inner {
            heap: BinaryHeap::new(),
            buffering: true,
            buffering_since_us: now,
            last_play_unix_us: None,
            last_enqueue_unix_us: None,
            last_progress_us: now,
            consecutive_drops: 0,
            stats: SchedulerStats::default(),
        };
        stats_cell.publish(&inner);

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Mutex::new(inner)),
            clock,
            params,
            stats_cell,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
        inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue sizing in effect
    pub fn params(&self) -> SchedulerParams {
        self.params
    }

    /// Start the release loop and the watchdog, releasing into `sink`
    pub fn start(&mut self, sink: Arc<dyn AudioSink>, on_chunk: ChunkCallback) {
        self.handles.push(self.spawn_release_task(sink, on_chunk));
        self.handles.push(self.spawn_watchdog_task());
        info!(
            buffer_target_chunks = self.params.buffer_target_chunks,
            max_queue_chunks = self.params.max_queue_chunks,
            "scheduler started"
        );
    }

    /// Offer one decoded buffer
    ///
    /// Maps the server timestamp to a play instant, drops the chunk when it
    /// is already past the late window or the queue is full, otherwise
    /// queues it by play instant.
    pub fn enqueue(&self, server_timestamp_us: u64, pcm: Vec<u8>) -> Result<()> {
        let play_at_unix_us = self.clock.server_to_unix_us(server_timestamp_us);
        self.admit(server_timestamp_us, pcm, play_at_unix_us, now_unix_us())
    }

    fn admit(
        &self,
        server_timestamp_us: u64,
        pcm: Vec<u8>,
        play_at_unix_us: u64,
        now: u64,
    ) -> Result<()> {
        let delta = play_at_unix_us as i64 - now as i64;

        let mut inner = Self::lock(&self.inner);
        inner.stats.received += 1;

        if delta < -LATE_WINDOW_US {
            inner.stats.dropped += 1;
            inner.consecutive_drops += 1;
            self.stats_cell.publish(&inner);
            return Err(Error::ChunkTooLate(delta));
        }

        if inner.heap.len() >= self.params.max_queue_chunks {
            let len = inner.heap.len();
            inner.stats.dropped += 1;
            self.stats_cell.publish(&inner);
            return Err(Error::SchedulerQueueFull(len));
        }

        inner.heap.push(Reverse(ScheduledBuffer {
            play_at_unix_us,
            pcm,
            server_timestamp_us,
        }));
        inner.last_enqueue_unix_us = Some(now);
        self.stats_cell.publish(&inner);

        Ok(())
    }

    /// Flush the queue and re-enter buffering (seek)
    ///
    /// The next chunks re-anchor playback; flushed chunks count as dropped.
    pub fn clear(&self) {
        let mut inner = Self::lock(&self.inner);
        let flushed = inner.heap.len() as u64;

        inner.stats.dropped += flushed;
        inner.heap.clear();
        inner.buffering = true;
        let now = now_unix_us();
        inner.buffering_since_us = now;
        inner.last_progress_us = now;
        inner.consecutive_drops = 0;
        self.stats_cell.publish(&inner);

        debug!(flushed, "scheduler cleared");
    }

    /// Exact point-in-time view
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = Self::lock(&self.inner);
        SchedulerSnapshot {
            stats: inner.stats,
            queue_len: inner.heap.len(),
            buffering: inner.buffering,
        }
    }

    /// Stop the release loop and watchdog
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        debug!("scheduler stopped");
    }

    fn spawn_release_task(
        &self,
        sink: Arc<dyn AudioSink>,
        on_chunk: ChunkCallback,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let stats_cell = Arc::clone(&self.stats_cell);
        let params = self.params;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(RELEASE_TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {}
                }

                let due = {
                    let mut inner = Self::lock(&inner);
                    let due = release_due(&mut inner, &params, now_unix_us());
                    stats_cell.publish(&inner);
                    due
                };

                for buffer in due {
                    match tokio::time::timeout(
                        Duration::from_millis(SINK_DRAIN_TIMEOUT_MS),
                        sink.play(&buffer.pcm),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("sink rejected chunk: {}", e),
                        Err(_) => debug!(
                            "sink did not drain within {}ms, continuing",
                            SINK_DRAIN_TIMEOUT_MS
                        ),
                    }
                    on_chunk(&buffer.pcm);
                }
            }
        })
    }

    fn spawn_watchdog_task(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let stats_cell = Arc::clone(&self.stats_cell);
        let clock = self.clock.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(WATCHDOG_TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {}
                }

                let mut inner = Self::lock(&inner);
                watchdog_check(&mut inner, clock.quality(), now_unix_us());
                stats_cell.publish(&inner);
            }
        })
    }
}

/// Pop every buffer whose play instant is within the release window
///
/// Buffers past the late window are dropped; the first buffer still beyond
/// the early window ends the scan. During buffering nothing is released
/// until the target depth is reached.
fn release_due(inner: &mut Inner, params: &SchedulerParams, now: u64) -> Vec<ScheduledBuffer> {
    if inner.buffering {
        if inner.heap.len() < params.buffer_target_chunks {
            return Vec::new();
        }
        inner.buffering = false;
        inner.last_progress_us = now;
        info!(queued = inner.heap.len(), "buffer filled, starting playback");
    }

    let mut due = Vec::new();

    loop {
        let delta = match inner.heap.peek() {
            Some(Reverse(next)) => next.play_at_unix_us as i64 - now as i64,
            None => break,
        };

        if delta > EARLY_WINDOW_US {
            break;
        }

        if let Some(Reverse(buffer)) = inner.heap.pop() {
            if delta < -LATE_WINDOW_US {
                inner.stats.dropped += 1;
                inner.consecutive_drops += 1;
            } else {
                inner.stats.played += 1;
                inner.last_play_unix_us = Some(now);
                inner.last_progress_us = now;
                inner.consecutive_drops = 0;
                due.push(buffer);
            }
        }
    }

    due
}

/// Evaluate the recovery triggers; at most one fires per tick
fn watchdog_check(inner: &mut Inner, clock_quality: ClockQuality, now: u64) {
    if inner.buffering {
        if now.saturating_sub(inner.buffering_since_us) > BUFFERING_TIMEOUT_US {
            warn!(
                queued = inner.heap.len(),
                "buffering exceeded 5s, forcing playback start"
            );
            inner.buffering = false;
            inner.last_progress_us = now;
        }
        return;
    }

    let silent_for = now.saturating_sub(inner.last_progress_us);
    let recently_enqueued = inner
        .last_enqueue_unix_us
        .map(|t| now.saturating_sub(t) < STALL_US)
        .unwrap_or(false);

    let reason = if recently_enqueued && silent_for > STALL_US {
        Some("chunks arriving but nothing played")
    } else if clock_quality == ClockQuality::Lost
        && inner.consecutive_drops > LOST_CLOCK_DROP_THRESHOLD
    {
        Some("clock sync lost with repeated late drops")
    } else if inner.heap.len() > STUCK_QUEUE_MIN && silent_for > STUCK_QUEUE_US {
        Some("queue stuck without playback")
    } else {
        None
    };

    if let Some(reason) = reason {
        recover(inner, now, reason);
    }
}

/// Flush the queue, re-enter buffering and reset the drop counter
fn recover(inner: &mut Inner, now: u64, reason: &str) {
    let flushed = inner.heap.len() as u64;
    warn!(reason, flushed, "scheduler recovery");

    inner.stats.dropped += flushed;
    inner.heap.clear();
    inner.buffering = true;
    inner.buffering_since_us = now;
    inner.last_progress_us = now;
    inner.consecutive_drops = 0;
}
