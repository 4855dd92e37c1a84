//! Per-process virtual time.

use std::time::Duration;

use faultline_trace::abi::TimePair;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Time charged for every trapped syscall.
pub const TRAP_QUANTUM: Duration = Duration::from_micros(1);

/// Monotonic clock a traced process sees instead of wall time.
///
/// It only moves when the harness moves it: by [`TRAP_QUANTUM`] on every
/// trap, and by the full timeout of a poll that found nothing. Two runs that
/// make the same decisions therefore observe the same timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualClock {
    secs: i64,
    nanos: i64,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self {
            secs: 244_244,
            nanos: 244_244_244,
        }
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(secs: i64, nanos: i64) -> Self {
        let mut clock = Self { secs, nanos: 0 };
        clock.add(0, nanos);
        clock
    }

    pub fn tick(&mut self) {
        self.advance(TRAP_QUANTUM);
    }

    pub fn advance(&mut self, by: Duration) {
        self.add(by.as_secs() as i64, i64::from(by.subsec_nanos()));
    }

    fn add(&mut self, secs: i64, nanos: i64) {
        let total = self.nanos + nanos;
        self.secs += secs + total.div_euclid(NANOS_PER_SEC);
        self.nanos = total.rem_euclid(NANOS_PER_SEC);
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn subsec_nanos(&self) -> i64 {
        self.nanos
    }

    /// As a `struct timespec`.
    pub fn timespec(&self) -> TimePair {
        TimePair::new(self.secs, self.nanos)
    }

    /// As a `struct timeval`.
    pub fn timeval(&self) -> TimePair {
        TimePair::new(self.secs, self.nanos / 1_000)
    }
}

/// Converts a `poll` timeout in milliseconds. Negative means "block
/// forever", which never advances the clock.
pub fn poll_timeout(millis: i32) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

/// Converts a `select` timeval. Malformed (negative) values are ignored.
pub fn select_timeout(tv: TimePair) -> Option<Duration> {
    let secs = u64::try_from(tv.secs).ok()?;
    let micros = u64::try_from(tv.sub).ok()?;
    Some(Duration::from_secs(secs) + Duration::from_micros(micros))
}
