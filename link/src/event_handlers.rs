//! Hooks fixed when a cable is built.
//!
//! [`EventHandlers`] complements the dynamic [`EventBus`](crate::events::EventBus)
//! listeners: hooks are wired once for application-wide concerns (logging,
//! UI status), bus listeners come and go with the code that registers them.
//! The cable runs the matching hook before fanning an event out to the bus.
//!
//! ```rust,no_run
//! use cable_link::{Cable, EventHandlers};
//!
//! # fn example() -> cable_link::Result<()> {
//! let hooks = EventHandlers::new()
//!     .on_connect(|info| println!("connected (restored={})", info.restored))
//!     .on_disconnect(|reason| println!("lost connection: {}", reason))
//!     .on_close(|err| println!("closed: {:?}", err));
//!
//! let cable = Cable::builder()
//!     .url("wss://example.com/cable")
//!     .event_handlers(hooks)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cable::CableEvent;
use crate::encoder::WireData;
use crate::error::CableError;
use crate::events::{ConnectInfo, InfoEvent};

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// Server-provided reason such as `server_restart`, or a local tag like
    /// `transport_closed`.
    pub message: String,
    /// Close code reported by the transport, when there is one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            code: Some(code),
            ..Self::new(message)
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        match self.code {
            Some(code) => write!(f, " (code: {})", code),
            None => Ok(()),
        }
    }
}

impl From<&CableError> for DisconnectReason {
    fn from(err: &CableError) -> Self {
        match err {
            CableError::Disconnected(reason) => reason.clone(),
            other => Self::new(other.to_string()),
        }
    }
}

/// Payload of [`EventHandlers::on_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    /// The monitor will keep reconnecting after this error.
    pub recoverable: bool,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&CableError> for ConnectionError {
    fn from(err: &CableError) -> Self {
        Self {
            message: err.to_string(),
            recoverable: err.is_connection_error(),
        }
    }
}

/// Direction of a raw frame passed to the frame hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

type Hook<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

/// Optional lifecycle hooks of a cable.
#[derive(Clone, Default)]
pub struct EventHandlers {
    connect: Hook<ConnectInfo>,
    disconnect: Hook<DisconnectReason>,
    close: Hook<Option<CableError>>,
    keepalive: Hook<Option<Value>>,
    info: Hook<InfoEvent>,
    error: Hook<ConnectionError>,
    receive: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    send: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = [
            ("connect", self.connect.is_some()),
            ("disconnect", self.disconnect.is_some()),
            ("close", self.close.is_some()),
            ("keepalive", self.keepalive.is_some()),
            ("info", self.info.is_some()),
            ("error", self.error.is_some()),
            ("receive", self.receive.is_some()),
            ("send", self.send.is_some()),
        ];
        f.debug_list()
            .entries(registered.iter().filter(|(_, set)| *set).map(|(name, _)| name))
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The server welcomed a connection. [`ConnectInfo`] tells whether it is
    /// a reconnect and whether the previous session was restored.
    pub fn on_connect(mut self, f: impl Fn(ConnectInfo) + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(f));
        self
    }

    /// The connection was lost; the monitor may bring it back.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Arc::new(f));
        self
    }

    /// Terminal close. `None` when the application closed the cable.
    pub fn on_close(mut self, f: impl Fn(Option<CableError>) + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_keepalive(mut self, f: impl Fn(Option<Value>) + Send + Sync + 'static) -> Self {
        self.keepalive = Some(Arc::new(f));
        self
    }

    pub fn on_info(mut self, f: impl Fn(InfoEvent) + Send + Sync + 'static) -> Self {
        self.info = Some(Arc::new(f));
        self
    }

    /// The transport reported an error it could not turn into a close.
    ///
    /// ```rust
    /// use cable_link::EventHandlers;
    ///
    /// let hooks = EventHandlers::new().on_error(|err| {
    ///     if !err.recoverable {
    ///         eprintln!("giving up on cable: {}", err);
    ///     }
    /// });
    /// ```
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Every raw inbound frame, before decoding.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(f));
        self
    }

    /// Every raw outbound frame, after encoding.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.send = Some(Arc::new(f));
        self
    }

    pub(crate) fn dispatch(&self, event: &CableEvent) {
        match event {
            CableEvent::Connect(info) => call(&self.connect, *info),
            CableEvent::Disconnect(err) => call(&self.disconnect, DisconnectReason::from(err)),
            CableEvent::Close(err) => call(&self.close, err.clone()),
            CableEvent::Keepalive(msg) => call(&self.keepalive, msg.clone()),
            CableEvent::Info(info) => call(&self.info, info.clone()),
        }
    }

    pub(crate) fn error(&self, err: &CableError) {
        call(&self.error, ConnectionError::from(err));
    }

    /// Frames are only rendered as text when a hook wants them.
    pub(crate) fn frame(&self, direction: Direction, data: &WireData) {
        let hook = match direction {
            Direction::Inbound => &self.receive,
            Direction::Outbound => &self.send,
        };
        if let Some(hook) = hook {
            hook(&data.as_text_lossy());
        }
    }
}

fn call<T>(hook: &Hook<T>, value: T) {
    if let Some(hook) = hook {
        hook(value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sync::lock;

    #[test]
    fn test_dispatch_reaches_matching_hook_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connects = seen.clone();
        let closes = seen.clone();
        let hooks = EventHandlers::new()
            .on_connect(move |info| lock(&connects).push(format!("connect {}", info.reconnect)))
            .on_close(move |err| lock(&closes).push(format!("close {}", err.is_some())));

        hooks.dispatch(&CableEvent::Connect(ConnectInfo {
            reconnect: true,
            restored: false,
        }));
        hooks.dispatch(&CableEvent::Keepalive(None));
        hooks.dispatch(&CableEvent::Close(None));

        assert_eq!(*lock(&seen), vec!["connect true", "close false"]);
        assert_eq!(format!("{:?}", hooks), r#"["connect", "close"]"#);
    }

    #[test]
    fn test_frame_hooks_follow_direction() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let hooks = EventHandlers::new().on_send(move |raw| lock(&sink).push(raw.to_string()));

        hooks.frame(Direction::Inbound, &WireData::Text("ignored".into()));
        hooks.frame(Direction::Outbound, &WireData::Binary(b"{}".to_vec().into()));
        assert_eq!(*lock(&sent), vec!["{}"]);
    }

    #[test]
    fn test_disconnect_reason_from_error() {
        let reason = DisconnectReason::from(&CableError::StaleConnection);
        assert_eq!(reason.code, None);
        assert!(reason.message.contains("Stale connection"));

        let original = DisconnectReason::with_code("server_restart", 1012);
        let reason = DisconnectReason::from(&CableError::Disconnected(original.clone()));
        assert_eq!(reason, original);
        assert_eq!(reason.to_string(), "server_restart (code: 1012)");
    }

    #[test]
    fn test_connection_error_recoverability() {
        assert!(ConnectionError::from(&CableError::NoConnection).recoverable);
        let rejected = ConnectionError::from(&CableError::SubscriptionRejected("x".into()));
        assert!(!rejected.recoverable);
    }
}
