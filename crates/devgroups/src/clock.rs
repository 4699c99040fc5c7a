//! Time source abstraction.
//!
//! The engine's timers are all relative deadlines computed against one
//! wall-clock source (spec: "one wall-clock source (`now_ms()`), millisecond
//! precision"). Routing that through a trait lets tests advance time
//! explicitly instead of sleeping for real.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// A millisecond time source.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds, relative to some fixed epoch.
    ///
    /// Only differences between two calls are meaningful; callers must not
    /// assume any particular absolute value or wall-clock alignment.
    fn now_ms(&self) -> u32;
}

/// Production clock, backed by [`Instant`].
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is the moment of construction.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Test clock that only advances when told to.
pub struct FakeClock {
    now: AtomicU32,
}

impl FakeClock {
    /// Create a fake clock starting at time 0.
    pub fn new() -> Self {
        Self {
            now: AtomicU32::new(0),
        }
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}
