// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks a single deadline across the several blocking steps of a report
/// (connect, each write, the final hang-up wait).
///
/// `Instant::now()` is a `clock_gettime(CLOCK_MONOTONIC)` call, which is
/// async-signal-safe, so this can be used from the crash handler.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Remaining time in the form `poll(2)` takes.
    /// Never returns a negative value (which `poll` would treat as infinite).
    pub fn remaining_poll_ms(&self) -> libc::c_int {
        let ms = self.remaining().as_millis();
        // Round a sub-millisecond remainder up so we don't spin on a zero timeout.
        if ms == 0 && !self.expired() {
            return 1;
        }
        ms.min(libc::c_int::MAX as u128) as libc::c_int
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("start_time", &self.start_time)
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_manager_new() {
        let timeout = Duration::from_secs(5);
        let manager = TimeoutManager::new(timeout);

        assert_eq!(manager.timeout(), timeout);
        assert!(manager.elapsed() < Duration::from_secs(1));
        assert!(!manager.expired());
        assert!(manager.remaining() <= timeout);
    }

    #[test]
    fn test_timeout_manager_expires() {
        let manager = TimeoutManager::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.expired());
        assert_eq!(manager.remaining(), Duration::ZERO);
        assert_eq!(manager.remaining_poll_ms(), 0);
    }

    #[test]
    fn test_timeout_manager_poll_ms() {
        let manager = TimeoutManager::new(Duration::from_secs(3));
        let ms = manager.remaining_poll_ms();
        assert!(ms > 2_000 && ms <= 3_000, "unexpected remaining {ms}");
    }

    #[test]
    fn test_timeout_manager_zero() {
        let manager = TimeoutManager::new(Duration::ZERO);
        assert!(manager.expired());
        assert_eq!(manager.remaining_poll_ms(), 0);
    }
}
