use std::fmt;
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::CableError;

use super::monitor_options::MonitorOptions;

/// Wire protocol spoken with the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Plain Action Cable.
    #[default]
    #[serde(rename = "actioncable-v1-json")]
    ActionCableV1Json,
    /// Action Cable extended with session recovery, history and presence.
    #[serde(rename = "actioncable-v1-ext-json")]
    ActionCableV1ExtJson,
}

impl ProtocolVersion {
    /// WebSocket subprotocol name announced during the handshake.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            ProtocolVersion::ActionCableV1Json => "actioncable-v1-json",
            ProtocolVersion::ActionCableV1ExtJson => "actioncable-v1-ext-json",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for ProtocolVersion {
    type Err = CableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "actioncable-v1-json" => Ok(ProtocolVersion::ActionCableV1Json),
            "actioncable-v1-ext-json" => Ok(ProtocolVersion::ActionCableV1ExtJson),
            other => Err(CableError::ConfigurationError(format!(
                "Unsupported protocol '{}'; expected actioncable-v1-json or actioncable-v1-ext-json",
                other
            ))),
        }
    }
}

/// Timestamp used to request history when a session is restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTimestamp {
    /// The moment the cable is created, then refreshed on every ping.
    #[default]
    Now,
    /// A fixed unix timestamp in seconds, refreshed on every ping.
    At(u64),
    /// Never request history by timestamp.
    Disabled,
}

/// What `perform` does with a failed command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformFailures {
    /// Return the error to the caller.
    #[default]
    Throw,
    /// Log the error and return `Ok(None)`.
    Warn,
    /// Return `Ok(None)` silently.
    Ignore,
}

/// Cable-level options.
///
/// # Example
///
/// ```rust
/// use cable_link::{CableOptions, MonitorOptions, ProtocolVersion};
///
/// let options = CableOptions::default()
///     .with_protocol(ProtocolVersion::ActionCableV1ExtJson)
///     .with_lazy(false)
///     .with_concurrent_subscribes(false)
///     .with_monitor(Some(MonitorOptions::default().with_max_reconnect_attempts(Some(10))));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CableOptions {
    #[serde(default)]
    pub protocol: ProtocolVersion,

    /// Defer connecting until the first subscribe.
    /// Default: true
    #[serde(default = "default_true")]
    pub lazy: bool,

    /// Allow subscribe commands of different subscriptions to be in flight
    /// at the same time. When false they are sent one at a time.
    /// Default: true
    #[serde(default = "default_true")]
    pub concurrent_subscribes: bool,

    #[serde(default)]
    pub history_timestamp: HistoryTimestamp,

    /// Answer server pings with `{"command":"pong"}` (extended protocol only).
    /// Default: false
    #[serde(default)]
    pub send_pongs: bool,

    #[serde(default)]
    pub perform_failures: PerformFailures,

    /// Maximum level this cable logs at.
    /// Default: Warn
    #[serde(default = "default_log_level")]
    pub log_level: LevelFilter,

    /// Liveness monitor and reconnect settings; `None` disables the monitor.
    #[serde(default = "default_monitor")]
    pub monitor: Option<MonitorOptions>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> LevelFilter {
    LevelFilter::Warn
}

fn default_monitor() -> Option<MonitorOptions> {
    Some(MonitorOptions::default())
}

impl Default for CableOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::default(),
            lazy: true,
            concurrent_subscribes: true,
            history_timestamp: HistoryTimestamp::Now,
            send_pongs: false,
            perform_failures: PerformFailures::Throw,
            log_level: LevelFilter::Warn,
            monitor: default_monitor(),
        }
    }
}

impl CableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_concurrent_subscribes(mut self, concurrent: bool) -> Self {
        self.concurrent_subscribes = concurrent;
        self
    }

    pub fn with_history_timestamp(mut self, timestamp: HistoryTimestamp) -> Self {
        self.history_timestamp = timestamp;
        self
    }

    pub fn with_send_pongs(mut self, send_pongs: bool) -> Self {
        self.send_pongs = send_pongs;
        self
    }

    pub fn with_perform_failures(mut self, policy: PerformFailures) -> Self {
        self.perform_failures = policy;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Set the monitor options. Pass `None` to disable the monitor.
    pub fn with_monitor(mut self, monitor: Option<MonitorOptions>) -> Self {
        self.monitor = monitor;
        self
    }
}
