// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

/// Byte budget enforced per transfer window.
///
/// The consumer accounts every byte it pushes to the wire with
/// [`consume()`](RateLimiter::consume); once the window budget is
/// exhausted the limiter reports [`is_blocked()`](RateLimiter::is_blocked)
/// until the driver of the transfer loop calls
/// [`replenish()`](RateLimiter::replenish) at the start of the next
/// window. A window of zero disables limiting.
#[derive(Debug, Default)]
pub struct RateLimiter {
    window_bytes: u64,
    consumed: u64,
}

impl RateLimiter {
    /// `window_bytes` is the byte budget per window; 0 means unlimited.
    pub fn new(window_bytes: u64) -> Self {
        RateLimiter {
            window_bytes,
            consumed: 0,
        }
    }

    /// Account `bytes` against the current window. Returns whether the
    /// budget still had room before this call.
    pub fn consume(&mut self, bytes: u64) -> bool {
        let had_room = !self.is_blocked();
        self.consumed = self.consumed.saturating_add(bytes);
        had_room
    }

    /// The limiter blocks when the window budget is exhausted.
    pub fn is_blocked(&self) -> bool {
        self.window_bytes != 0 && self.consumed >= self.window_bytes
    }

    /// Byte budget of one window. Unlimited reports `u64::MAX`.
    pub fn window_bytes(&self) -> u64 {
        if self.window_bytes == 0 {
            u64::MAX
        } else {
            self.window_bytes
        }
    }

    /// Start a new window.
    pub fn replenish(&mut self) {
        self.consumed = 0;
    }

    /// Change the per-window budget; 0 disables limiting.
    pub fn set_window_bytes(&mut self, window_bytes: u64) {
        self.window_bytes = window_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_budget() {
        let mut limiter = RateLimiter::new(100);
        assert!(!limiter.is_blocked());
        assert!(limiter.consume(60));
        assert!(limiter.consume(60));
        assert!(limiter.is_blocked());
        assert!(!limiter.consume(1));

        limiter.replenish();
        assert!(!limiter.is_blocked());
        assert_eq!(limiter.window_bytes(), 100);
    }

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::new(0);
        limiter.consume(u64::MAX);
        assert!(!limiter.is_blocked());
        assert_eq!(limiter.window_bytes(), u64::MAX);
    }
}
