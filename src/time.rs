//! Wall-clock time source
//!
//! Every play instant and sync timestamp in this crate is expressed in Unix
//! microseconds read through [`now_unix_us`]. The clock filter maps server
//! loop time onto this timeline, and the scheduler waits on it with a
//! real-time primitive, so a wall clock is required end to end. Interval
//! timers (release tick, watchdog, sync loop) run on tokio's monotonic
//! clock instead. System clock jumps propagate into play instants; that
//! trade-off is accepted.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix microseconds.
pub fn now_unix_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_plausible() {
        // 2020-01-01 in Unix microseconds
        let epoch_2020 = 1_577_836_800_000_000u64;
        assert!(now_unix_us() > epoch_2020);
    }

    #[test]
    fn test_now_is_nondecreasing() {
        let a = now_unix_us();
        let b = now_unix_us();
        assert!(b >= a);
    }
}
