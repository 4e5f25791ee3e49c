//! Clock synchronization
//!
//! Maps the server's monotonic loop timeline onto local Unix microseconds
//! from time-sync exchanges, and tracks the quality of that mapping.

pub mod clock;

pub use clock::{ClockFilter, ClockQuality, SharedClock};
