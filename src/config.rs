// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::task::Activity;
use crate::transfer::RetryPolicy;

/// Settings consumed by the transfer engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Apply the user download limit in `max_downloads`
    pub max_downloads_enabled: bool,
    /// Number of concurrent downloads when the limit is enabled
    pub max_downloads: usize,
    /// Upper bound on concurrent downloads in all cases (0 = no cap)
    pub max_downloads_hard_cap: usize,
    /// Number of concurrent device sync workers
    pub max_sync_workers: usize,
    /// Apply the bandwidth cap in `limit_rate_kbps`
    pub limit_rate_enabled: bool,
    /// Bandwidth cap in KiB/s
    pub limit_rate_kbps: f64,
    /// Retry budget for HTTP-level retries and for short-read restarts
    pub retries: u32,
    /// Delay between whole-transfer attempts after a short read
    pub retry_delay_ms: u64,
    /// Base back-off between HTTP-level retries
    pub retry_backoff_ms: u64,
    /// Minimum time between two progress notifications
    pub progress_interval_ms: u64,
    /// Sort queued batches by publish date, oldest first
    pub chronological_order: bool,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout (0 = none)
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_downloads_enabled: false,
            max_downloads: 3,
            max_downloads_hard_cap: 16,
            max_sync_workers: 1,
            limit_rate_enabled: false,
            limit_rate_kbps: 500.0,
            retries: 3,
            retry_delay_ms: 1000,
            retry_backoff_ms: 250,
            progress_interval_ms: 1000,
            chronological_order: true,
            connect_timeout_secs: 30,
            request_timeout_secs: 0,
            user_agent: format!("podqueue/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Bandwidth cap as configured, compared by the throttle to detect live changes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub enabled: bool,
    pub kbps: f64,
}

impl RateLimit {
    pub const UNLIMITED: RateLimit = RateLimit {
        enabled: false,
        kbps: 0.0,
    };

    /// The cap in bytes per second, if one applies
    pub fn bytes_per_sec(&self) -> Option<f64> {
        (self.enabled && self.kbps > 0.0).then(|| self.kbps * 1024.0)
    }
}

impl Config {
    /// Load settings from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Worker bound for an activity
    ///
    /// Downloads without an enabled user limit run up to the hard cap; a hard
    /// cap of zero means "no limit" and maps to `usize::MAX`.
    pub fn max_workers(&self, activity: Activity) -> usize {
        match activity {
            Activity::Download => {
                let cap = match self.max_downloads_hard_cap {
                    0 => usize::MAX,
                    cap => cap,
                };
                if self.max_downloads_enabled && self.max_downloads > 0 {
                    self.max_downloads.min(cap)
                } else {
                    cap
                }
            }
            Activity::Synchronize => self.max_sync_workers.max(1),
        }
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            enabled: self.limit_rate_enabled,
            kbps: self.limit_rate_kbps,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_retries(self.retries)
            .with_backoff(Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Live-reloadable settings shared by every part of the engine
///
/// Readers take a snapshot at each decision point, so an `update` takes
/// effect on the next spawn check, worker iteration or throttle sample.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Apply a change in place
    pub fn update<F: FnOnce(&mut Config)>(&self, change: F) {
        change(&mut *self.inner.write());
    }

    pub fn max_workers(&self, activity: Activity) -> usize {
        self.inner.read().max_workers(activity)
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.inner.read().rate_limit()
    }
}
