//! Reconnection policy: exponential backoff and close classification.
//!
//! TRADE-OFFS
//! ==========
//! Two historical variants of this policy disagreed on the multiplier
//! base (1s vs 3s) and on whether the delay was capped. The canonical
//! policy here is base 1s doubling per attempt, capped at 30s, at most
//! 5 attempts; after that the connection is terminal and the user is
//! asked to restart.

#[cfg(test)]
#[path = "backoff_test.rs"]
mod backoff_test;

use std::time::Duration;

/// WebSocket close codes that mean the peer shut down normally.
const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1001];

/// How a closed or failed connection should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseClass {
    /// Deliberate shutdown; do not reconnect.
    Normal,
    /// Authentication-related; clear credentials, require re-login.
    FatalAuth,
    /// Transient transport failure; reconnect with backoff.
    Retryable,
}

/// Classify a transport close by code and reason.
#[must_use]
pub fn classify_close(code: u16, reason: &str) -> CloseClass {
    if is_fatal_auth_error(reason) {
        return CloseClass::FatalAuth;
    }
    if NORMAL_CLOSE_CODES.contains(&code) {
        return CloseClass::Normal;
    }
    CloseClass::Retryable
}

/// Whether an error text marks an unrecoverable auth/token failure.
#[must_use]
pub fn is_fatal_auth_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("auth") || lowered.contains("token")
}

/// Exponential reconnect backoff bounded by an attempt cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay for attempt 0.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Attempts allowed before the connection turns terminal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt index: `base * 2^attempt`, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.cap);
        delay.min(self.cap)
    }
}
