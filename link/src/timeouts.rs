//! Timeouts for the one-shot waits of a cable.
//!
//! Liveness and reconnect timing live in [`MonitorOptions`](crate::MonitorOptions);
//! this covers opening the transport (up to the welcome), subscribe
//! confirmations, the resubscribe cooldown and presence queries.

use std::time::Duration;

/// Durations at or above this are treated as "wait forever".
const UNBOUNDED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// ```rust
/// use cable_link::CableTimeouts;
/// use std::time::Duration;
///
/// let timeouts = CableTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .subscribe_timeout_secs(15)
///     .build();
/// assert_eq!(timeouts.presence_timeout, CableTimeouts::default().presence_timeout);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CableTimeouts {
    /// Open the transport and receive the welcome. Default 10s.
    pub connection_timeout: Duration,
    /// Wait for `confirm_subscription`. A timed out subscribe is not retried.
    /// Default 5s.
    pub subscribe_timeout: Duration,
    /// A subscribe within this long after an unsubscribe of the same
    /// identifier is delayed by 1.5x the cooldown. Default 500ms.
    pub subscribe_cooldown: Duration,
    /// Wait for a presence `info` reply. Default 5s.
    pub presence_timeout: Duration,
}

impl Default for CableTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            subscribe_cooldown: Duration::from_millis(500),
            presence_timeout: Duration::from_secs(5),
        }
    }
}

impl CableTimeouts {
    pub fn builder() -> CableTimeoutsBuilder {
        CableTimeoutsBuilder {
            timeouts: Self::default(),
        }
    }

    /// Short waits for a server on the same machine.
    pub fn local() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(2),
            subscribe_cooldown: Duration::from_millis(100),
            presence_timeout: Duration::from_secs(2),
        }
    }

    /// Zero or absurdly long durations disable the timeout.
    pub fn is_unbounded(duration: Duration) -> bool {
        duration.is_zero() || duration >= UNBOUNDED
    }
}

#[derive(Debug, Clone)]
pub struct CableTimeoutsBuilder {
    timeouts: CableTimeouts,
}

impl CableTimeoutsBuilder {
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    pub fn subscribe_timeout_secs(self, secs: u64) -> Self {
        self.subscribe_timeout(Duration::from_secs(secs))
    }

    pub fn subscribe_cooldown(mut self, cooldown: Duration) -> Self {
        self.timeouts.subscribe_cooldown = cooldown;
        self
    }

    pub fn subscribe_cooldown_ms(self, ms: u64) -> Self {
        self.subscribe_cooldown(Duration::from_millis(ms))
    }

    pub fn presence_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.presence_timeout = timeout;
        self
    }

    pub fn presence_timeout_secs(self, secs: u64) -> Self {
        self.presence_timeout(Duration::from_secs(secs))
    }

    pub fn build(self) -> CableTimeouts {
        self.timeouts
    }
}
