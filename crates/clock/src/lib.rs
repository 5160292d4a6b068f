// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Monotonic time source shared by the governor, control lab, and flight recorder.
//!
//! All components that make cooldown or interval decisions read time through the
//! [`Clock`] trait rather than calling [`std::time::Instant::now`] directly, so that
//! tests can drive time deterministically with [`FakeClock`] instead of racing the
//! wall clock.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// An opaque monotonic timestamp, anchored at clock construction.
///
/// `MonoTime` values are only meaningfully comparable against other values
/// produced by the same [`Clock`] instance. Subtraction never underflows in
/// practice because a clock's `now()` is non-decreasing for its lifetime; the
/// [`MonoTime::duration_since`] method saturates at zero as a defensive measure
/// regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonoTime(Duration);

impl MonoTime {
    /// The elapsed duration between an earlier `self` and a later `earlier` value.
    ///
    /// Saturates to `Duration::ZERO` if `earlier` is actually later than `self`.
    #[must_use]
    pub fn duration_since(&self, earlier: MonoTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

/// A monotonic time source.
///
/// Implementations must be cheap to call repeatedly (the control lab and
/// governor call `now()` on every tick and every update) and safe to share
/// across threads.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Returns the current time as measured by this clock.
    fn now(&self) -> MonoTime;

    /// Convenience: elapsed time since an earlier `MonoTime` from this clock.
    fn since(&self, earlier: MonoTime) -> Duration {
        self.now().duration_since(earlier)
    }
}

/// A [`Clock`] backed by the operating system's monotonic clock.
///
/// Anchored at construction time so that `now()` values start near zero,
/// matching the "opaque, implementation-defined epoch" contract rather than
/// leaking process-uptime or wall-clock values to callers.
#[derive(Debug)]
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    /// Creates a new system clock anchored to the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.anchor.elapsed())
    }
}

/// A [`Clock`] whose value only moves when explicitly advanced.
///
/// Used throughout the governor, control-lab, and flight-recorder test suites
/// to assert exact scale transitions and cooldown behaviour without racing
/// real time.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Mutex<Duration>,
}

impl FakeClock {
    /// Creates a fake clock starting at `t = 0`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Duration::ZERO),
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Wraps this clock in an `Arc` for sharing across components under test.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> MonoTime {
        MonoTime(*self.now.lock())
    }
}
