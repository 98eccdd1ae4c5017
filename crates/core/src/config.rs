//! Controller tuning. Defaults mirror client-go's workqueue limiter and the
//! reflector's watch backoff; every knob can be overridden with a `WEIR_*`
//! environment variable.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    /// First handler retry delay.
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Requeues allowed per key before a failure is treated as terminal.
    pub max_retries: Option<u32>,
    pub watch_backoff_initial_ms: u64,
    pub watch_backoff_max_secs: u64,
    /// Periodic full relist; 0 disables.
    pub relist_secs: u64,
    /// Periodic re-enqueue of every cached key; 0 disables.
    pub resync_secs: u64,
    /// Server-side watch timeout hint.
    pub watch_timeout_secs: u32,
    pub error_sink_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 5,
            retry_max_ms: 1_000_000,
            max_retries: None,
            watch_backoff_initial_ms: 800,
            watch_backoff_max_secs: 30,
            relist_secs: 0,
            resync_secs: 0,
            watch_timeout_secs: 290,
            error_sink_cap: 256,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Build from an arbitrary variable source; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn get<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
            lookup(name).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }
        let d = Self::default();
        Self {
            retry_base_ms: get(&lookup, "WEIR_RETRY_BASE_MS", d.retry_base_ms),
            retry_max_ms: get(&lookup, "WEIR_RETRY_MAX_MS", d.retry_max_ms),
            max_retries: lookup("WEIR_MAX_RETRIES").and_then(|s| s.trim().parse().ok()),
            watch_backoff_initial_ms: get(&lookup, "WEIR_WATCH_BACKOFF_INITIAL_MS", d.watch_backoff_initial_ms),
            watch_backoff_max_secs: get(&lookup, "WEIR_WATCH_BACKOFF_MAX_SECS", d.watch_backoff_max_secs),
            relist_secs: get(&lookup, "WEIR_RELIST_SECS", d.relist_secs),
            resync_secs: get(&lookup, "WEIR_RESYNC_SECS", d.resync_secs),
            watch_timeout_secs: get(&lookup, "WEIR_WATCH_TIMEOUT_SECS", d.watch_timeout_secs),
            error_sink_cap: get(&lookup, "WEIR_ERROR_SINK_CAP", d.error_sink_cap).max(1),
        }
    }

    pub fn retry_backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.retry_base_ms), Duration::from_millis(self.retry_max_ms))
    }

    pub fn watch_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.watch_backoff_initial_ms),
            Duration::from_secs(self.watch_backoff_max_secs),
        )
    }

    pub fn relist_period(&self) -> Option<Duration> {
        (self.relist_secs > 0).then(|| Duration::from_secs(self.relist_secs))
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }
}
