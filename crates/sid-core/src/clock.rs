// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A swappable source of monotonic time, so idle/exec timeout logic can be
//! driven deterministically in tests instead of racing the wall clock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A monotonic clock. `SystemClock` wraps `Instant::now`; `FakeClock` is
/// advanced explicitly by tests exercising timer event sources.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Instant>>,
}

impl FakeClock {
    /// Anchors the fake clock to the real current instant. Real-time
    /// anchoring (rather than an arbitrary epoch) keeps `Instant` arithmetic
    /// in `reactor` valid even when a test never calls `advance`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }

    pub fn set(&self, to: Instant) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }
}
