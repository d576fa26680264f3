//! Error types for cable-link.
//!
//! A single [`CableError`] is used across the crate. It is `Clone` because one
//! connection loss has to reach every pending subscribe, perform and channel
//! listener at once.

use thiserror::Error;

use crate::event_handlers::DisconnectReason;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CableError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CableError {
    /// The server explicitly refused a subscribe request.
    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// The transport or the server dropped the connection.
    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),

    /// Client-side liveness check failed (too many missed pings).
    #[error("Stale connection: no pings received")]
    StaleConnection,

    /// An operation was attempted while the cable has no live connection.
    #[error("No connection")]
    NoConnection,

    #[error("Command failed: {0}")]
    CommandError(String),

    #[error("Subscription timeout for {identifier} after {timeout_ms}ms")]
    SubscriptionTimeout { identifier: String, timeout_ms: u64 },

    #[error("Already subscribing to {0}")]
    AlreadySubscribing(String),

    /// The subscription was unsubscribed or disposed while the operation waited.
    #[error("Subscription is closed: {0}")]
    SubscriptionClosed(String),

    #[error("Channel is already attached to another cable")]
    AlreadyAttached,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The cable was closed by the application.
    #[error("Cable closed")]
    Closed,
}

impl CableError {
    /// Convenience constructor for a disconnect with a plain message.
    pub fn disconnected(message: impl Into<String>) -> Self {
        CableError::Disconnected(DisconnectReason::new(message))
    }

    /// Stable machine-readable tag for this error.
    ///
    /// Integration layers use it to tell a server-side rejection apart from
    /// a network failure without matching on variants.
    pub fn reason(&self) -> &'static str {
        match self {
            CableError::SubscriptionRejected(_) => "rejected",
            CableError::Disconnected(_) => "disconnected",
            CableError::StaleConnection => "stale_connection",
            CableError::NoConnection => "no_connection",
            CableError::CommandError(_) => "command_error",
            CableError::SubscriptionTimeout { .. } => "subscription_timeout",
            CableError::AlreadySubscribing(_) => "already_subscribing",
            CableError::SubscriptionClosed(_) => "subscription_closed",
            CableError::AlreadyAttached => "already_attached",
            CableError::InvalidState(_) => "invalid_state",
            CableError::EncodeError(_) => "encode_error",
            CableError::DecodeError(_) => "decode_error",
            CableError::TransportError(_) => "transport_error",
            CableError::ConfigurationError(_) => "configuration_error",
            CableError::TimeoutError(_) => "timeout",
            CableError::Closed => "closed",
        }
    }

    /// Errors caused by losing the connection.
    ///
    /// These are handled by the reconnect flow: a subscribe failing with one
    /// of them keeps its channels and is retried after the next connect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CableError::Disconnected(_)
                | CableError::StaleConnection
                | CableError::NoConnection
                | CableError::TransportError(_)
                | CableError::Closed
        )
    }
}

impl From<serde_json::Error> for CableError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CableError::DecodeError(err.to_string())
        } else {
            CableError::EncodeError(err.to_string())
        }
    }
}

impl From<url::ParseError> for CableError {
    fn from(err: url::ParseError) -> Self {
        CableError::ConfigurationError(format!("Invalid URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_tags() {
        assert_eq!(CableError::SubscriptionRejected("x".into()).reason(), "rejected");
        assert_eq!(CableError::disconnected("server_restart").reason(), "disconnected");
        assert_eq!(CableError::StaleConnection.reason(), "stale_connection");
        assert_eq!(CableError::NoConnection.reason(), "no_connection");
    }

    #[test]
    fn test_connection_errors() {
        assert!(CableError::disconnected("gone").is_connection_error());
        assert!(CableError::StaleConnection.is_connection_error());
        assert!(!CableError::SubscriptionRejected("x".into()).is_connection_error());
        assert!(!CableError::SubscriptionTimeout {
            identifier: "x".into(),
            timeout_ms: 5000
        }
        .is_connection_error());
    }

    #[test]
    fn test_display_includes_reason() {
        let err = CableError::Disconnected(DisconnectReason::with_code("going away", 1001));
        assert_eq!(err.to_string(), "Disconnected: going away (code: 1001)");
    }
}
