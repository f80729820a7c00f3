// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer speed sampling and bandwidth throttling
//!
//! Speed is measured every [`SAMPLE_EVERY`] blocks against a baseline taken
//! at the first sample after the rate limit last changed. With a cap in
//! place, a transfer that ran ahead of it is told how long to sleep so the
//! bytes since the baseline line up with the capped rate again.

use std::time::{Duration, Instant};

use crate::config::RateLimit;

/// Blocks between two speed samples
pub const SAMPLE_EVERY: u64 = 5;

/// Longest single throttle sleep
pub const MAX_SLEEP: Duration = Duration::from_secs(10);

/// Outcome of one [`Throttle::sample`] call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// Bytes per second since the baseline, when measured
    pub speed: Option<f64>,
    /// How long the caller should sleep to respect the cap
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    at: Instant,
    block: u64,
}

/// Per-attempt throttle state
#[derive(Debug, Default)]
pub struct Throttle {
    limit: Option<RateLimit>,
    baseline: Option<Baseline>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the block counter after a block was written
    ///
    /// `now` is passed in so the caller decides which clock to use.
    pub fn sample(&mut self, now: Instant, block: u64, block_size: usize, limit: RateLimit) -> Sample {
        if self.limit != Some(limit) {
            self.limit = Some(limit);
            self.baseline = None;
        }

        if block % SAMPLE_EVERY != 0 {
            return Sample::default();
        }

        let Some(baseline) = self.baseline else {
            self.baseline = Some(Baseline { at: now, block });
            return Sample::default();
        };

        let passed = now.saturating_duration_since(baseline.at).as_secs_f64();
        let bytes = block.saturating_sub(baseline.block) * block_size as u64;
        if passed <= 0.0 || bytes == 0 {
            return Sample::default();
        }

        let speed = bytes as f64 / passed;
        let delay = limit
            .bytes_per_sec()
            .filter(|&cap| speed > cap)
            .map(|cap| {
                let should_have_passed = bytes as f64 / cap;
                Duration::from_secs_f64((should_have_passed - passed).max(0.0)).min(MAX_SLEEP)
            });

        Sample {
            speed: Some(speed),
            delay,
        }
    }
}
