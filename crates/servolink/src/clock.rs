//! The clock used for effect timestamps.
//!
//! All connected devices are synchronized to one monotonic clock, so effect
//! start times can be specified as absolute timestamps. The tick rate is
//! fixed at 1 GHz (nanosecond ticks).

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Tick rate of [`now`] in Hz.
pub const TIMESTAMP_FREQUENCY_HZ: u64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A point on the session clock, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Shift this timestamp forward.
    pub fn after(self, d: Duration) -> Timestamp {
        Timestamp(self.0 + d.as_nanos() as u64)
    }

    /// Raw tick value.
    pub fn ticks(self) -> u64 {
        self.0
    }
}

/// Current timestamp of the session clock.
pub fn now() -> Timestamp {
    Timestamp(epoch().elapsed().as_nanos() as u64)
}

/// Convert a duration into clock ticks.
pub fn ticks(d: Duration) -> u64 {
    d.as_nanos() as u64
}
