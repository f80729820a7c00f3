// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

/// Status codes a server uses for "try again later"
const RETRYABLE_STATUSES: &[u16] = &[408, 418, 425, 429, 500, 502, 503, 504, 598, 599];

/// Upper bound for a single back-off sleep
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-request retry budget of the HTTP layer
///
/// Connect errors and retryable status codes have separate budgets; the
/// redirect budget is applied by the HTTP client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connect: u32,
    pub status: u32,
    pub redirect: u32,
    /// Base delay, doubled after every retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retries(3)
    }
}

impl RetryPolicy {
    /// `n` connect and status retries, `max(3, n)` redirects, no back-off
    pub fn from_retries(n: u32) -> Self {
        Self {
            connect: n,
            status: n,
            redirect: n.max(3),
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
            .min(MAX_BACKOFF)
    }
}
