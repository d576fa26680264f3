use std::fmt;

use serde::{Deserialize, Serialize};

use crate::monitor::ReconnectStrategy;

/// Parameters of the default exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffOptions {
    /// Growth factor per attempt.
    /// Default: 2.0
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,

    /// Upper bound of the random stretch applied to each delay; 0.5 stretches
    /// a delay by up to 100%.
    /// Default: 0.5
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Cap for a single delay. Default: none.
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_backoff_rate() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.5
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            backoff_rate: 2.0,
            jitter_ratio: 0.5,
            max_interval_ms: None,
        }
    }
}

/// Connection monitor options.
#[derive(Clone, Serialize, Deserialize)]
pub struct MonitorOptions {
    /// Expected interval between server pings.
    /// Default: 3000ms
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Missed pings tolerated before the connection is declared stale.
    /// Default: 2
    #[serde(default = "default_max_missing_pings")]
    pub max_missing_pings: u32,

    /// Reconnect attempts before giving up and closing the cable.
    /// Default: None (unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// First reconnect delay of the default strategy.
    /// Default: 1000ms
    #[serde(default = "default_base_reconnect_interval_ms")]
    pub base_reconnect_interval_ms: u64,

    #[serde(default = "default_monitor_backoff")]
    pub backoff: BackoffOptions,

    /// Custom reconnect delay per attempt, replacing the default backoff.
    #[serde(skip)]
    pub reconnect_strategy: Option<ReconnectStrategy>,
}

fn default_ping_interval_ms() -> u64 {
    3000
}

fn default_max_missing_pings() -> u32 {
    2
}

fn default_base_reconnect_interval_ms() -> u64 {
    1000
}

fn default_monitor_backoff() -> BackoffOptions {
    BackoffOptions {
        max_interval_ms: Some(120_000),
        ..BackoffOptions::default()
    }
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            ping_interval_ms: 3000,
            max_missing_pings: 2,
            max_reconnect_attempts: None,
            base_reconnect_interval_ms: 1000,
            backoff: default_monitor_backoff(),
            reconnect_strategy: None,
        }
    }
}

impl fmt::Debug for MonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOptions")
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("max_missing_pings", &self.max_missing_pings)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("base_reconnect_interval_ms", &self.base_reconnect_interval_ms)
            .field("backoff", &self.backoff)
            .field("reconnect_strategy", &self.reconnect_strategy.is_some())
            .finish()
    }
}

impl MonitorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = ms;
        self
    }

    pub fn with_max_missing_pings(mut self, count: u32) -> Self {
        self.max_missing_pings = count;
        self
    }

    /// Pass None for unlimited attempts, Some(0) to never reconnect.
    pub fn with_max_reconnect_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_base_reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.base_reconnect_interval_ms = ms;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: ReconnectStrategy) -> Self {
        self.reconnect_strategy = Some(strategy);
        self
    }
}
