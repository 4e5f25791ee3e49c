//! Server-to-local clock filter
//!
//! Each sync exchange yields four timestamps: client transmit (t1) and
//! receive (t4) on the local wall clock, server receive (t2) and transmit
//! (t3) on the server's monotonic loop timeline. The filter anchors the
//! loop origin from the first accepted sample and afterwards only grades
//! quality; the anchor is never rewritten during a session.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::time::now_unix_us;

/// Samples with a round trip at or above this are rejected
pub const MAX_RTT_US: i64 = 100_000;

/// Accepted samples with a round trip at or above this degrade quality
pub const DEGRADED_RTT_US: i64 = 50_000;

/// Quality drops to lost after this long without any sync sample
pub const SYNC_STALE_US: u64 = 5_000_000;

/// How far ahead of now an unmapped timestamp is estimated to play
pub const LOST_ESTIMATE_AHEAD_US: u64 = 500_000;

/// A mapping further than this from now is treated as broken
const MAPPING_SANITY_WINDOW_US: u64 = 3_600_000_000;

/// Quality of the server-to-local mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockQuality {
    /// Recent sample with a tight round trip
    Good,
    /// Recent sample but round trip at or above 50 ms
    Degraded,
    /// No anchor yet, or no sample for 5 s
    Lost,
}

/// Clock filter state
#[derive(Debug)]
pub struct ClockFilter {
    /// Unix microseconds at which the server loop timeline was at zero.
    /// Anchored by the first accepted sample, never rewritten.
    server_loop_origin_unix_us: Option<u64>,
    /// Round trip of the last accepted sample
    rtt_us: i64,
    /// Current mapping quality
    quality: ClockQuality,
    /// Wall clock of the last sample, accepted or rejected
    last_sync_at_unix_us: u64,
    /// Count of accepted samples this session
    samples_accepted: u64,
}

impl ClockFilter {
    /// Create a filter with no anchor; quality starts lost
    pub fn new() -> Self {
        Self {
            server_loop_origin_unix_us: None,
            rtt_us: 0,
            quality: ClockQuality::Lost,
            last_sync_at_unix_us: now_unix_us(),
            samples_accepted: 0,
        }
    }

    /// Feed one sync exchange into the filter
    ///
    /// `t1` and `t4` are client wall-clock microseconds, `t2` and `t3` are
    /// server loop microseconds. Returns whether the sample was accepted.
    pub fn submit_sample(&mut self, t1: u64, t2: u64, t3: u64, t4: u64) -> bool {
        let now = now_unix_us();
        self.last_sync_at_unix_us = now;

        let rtt = (t4 as i64 - t1 as i64) - (t3 as i64 - t2 as i64);

        if rtt < 0 || rtt >= MAX_RTT_US {
            debug!(rtt_us = rtt, "rejecting sync sample");
            return false;
        }

        self.rtt_us = rtt;
        self.samples_accepted += 1;

        if self.server_loop_origin_unix_us.is_none() {
            self.server_loop_origin_unix_us = Some(now.saturating_sub(t2));
            self.quality = ClockQuality::Good;
            debug!(
                origin_unix_us = self.server_loop_origin_unix_us,
                rtt_us = rtt,
                "clock anchored"
            );
        } else {
            self.quality = if rtt < DEGRADED_RTT_US {
                ClockQuality::Good
            } else {
                ClockQuality::Degraded
            };
        }

        true
    }

    /// Map a server loop timestamp to local Unix microseconds
    ///
    /// While the mapping is lost or unanchored, or when the mapped instant
    /// is more than an hour from now (wild server-clock drift), a
    /// conservative 500 ms-ahead estimate is returned so the scheduler
    /// treats the chunk as imminent rather than ancient.
    pub fn server_to_unix_us(&self, server_ts: u64) -> u64 {
        let now = now_unix_us();
        let estimate = now + LOST_ESTIMATE_AHEAD_US;

        let origin = match self.server_loop_origin_unix_us {
            Some(origin) if self.quality != ClockQuality::Lost => origin,
            _ => return estimate,
        };

        let mapped = origin.saturating_add(server_ts);
        if mapped.abs_diff(now) > MAPPING_SANITY_WINDOW_US {
            warn!(
                mapped_unix_us = mapped,
                "mapped play instant over an hour from now, using estimate"
            );
            return estimate;
        }

        mapped
    }

    /// Downgrade quality to lost when no sample has arrived for 5 s
    pub fn tick(&mut self) {
        if self.quality != ClockQuality::Lost
            && now_unix_us().saturating_sub(self.last_sync_at_unix_us) > SYNC_STALE_US
        {
            warn!("no sync sample for over 5s, clock quality lost");
            self.quality = ClockQuality::Lost;
        }
    }

    /// Current mapping quality
    pub fn quality(&self) -> ClockQuality {
        self.quality
    }

    /// Round trip of the last accepted sample, microseconds
    pub fn rtt_us(&self) -> i64 {
        self.rtt_us
    }

    /// The anchored loop origin, if any
    pub fn origin_unix_us(&self) -> Option<u64> {
        self.server_loop_origin_unix_us
    }

    /// Count of accepted samples this session
    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted
    }

    #[cfg(test)]
    fn set_last_sync_at(&mut self, unix_us: u64) {
        self.last_sync_at_unix_us = unix_us;
    }
}

impl Default for ClockFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to a clock filter shared between the session task and
/// the scheduler tasks. Critical sections are short and never held across
/// an await.
#[derive(Debug, Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<ClockFilter>>,
}

impl SharedClock {
    /// Wrap a fresh filter
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockFilter::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockFilter> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// See [`ClockFilter::submit_sample`]
    pub fn submit_sample(&self, t1: u64, t2: u64, t3: u64, t4: u64) -> bool {
        self.lock().submit_sample(t1, t2, t3, t4)
    }

    /// See [`ClockFilter::server_to_unix_us`]
    pub fn server_to_unix_us(&self, server_ts: u64) -> u64 {
        self.lock().server_to_unix_us(server_ts)
    }

    /// See [`ClockFilter::tick`]
    pub fn tick(&self) {
        self.lock().tick();
    }

    /// See [`ClockFilter::quality`]
    pub fn quality(&self) -> ClockQuality {
        self.lock().quality()
    }

    /// See [`ClockFilter::origin_unix_us`]
    pub fn origin_unix_us(&self) -> Option<u64> {
        self.lock().origin_unix_us()
    }

    /// See [`ClockFilter::samples_accepted`]
    pub fn samples_accepted(&self) -> u64 {
        self.lock().samples_accepted()
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new()
    }
}
