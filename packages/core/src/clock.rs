//! Wall-clock abstraction shared by the QoS modules.
//!
//! Every time-dependent decision in the bus (circuit breaker decay, throttling
//! windows, retry scheduling, cache expiry) reads the time through a
//! [`ClockSource`] so tests can drive time explicitly with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds in one hour.
const MILLIS_PER_HOUR: u64 = 3_600_000;

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync + std::fmt::Debug {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;

    /// Hour of day (0-23) at the given UTC offset.
    fn hour_of_day(&self, utc_offset_minutes: i32) -> u32 {
        let offset_ms = i64::from(utc_offset_minutes) * 60_000;
        #[allow(clippy::cast_possible_wrap)]
        let local = (self.now() as i64).saturating_add(offset_ms).max(0);
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let hour = ((local as u64 / MILLIS_PER_HOUR) % 24) as u32;
        hour
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Time only moves when [`advance`](Self::advance) or [`set`](Self::set) is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_millis`.
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Moves the clock forward by `by`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jumps the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
