//! Transport abstraction.
//!
//! A transport moves encoded frames between the cable and the server and
//! reports what happens to the connection through its [`EventBus`]:
//!
//! - `Open` once a connection is established,
//! - `Data` for every inbound frame, in arrival order,
//! - `Error` for non-fatal problems worth reporting,
//! - `Close` when the connection ends for any reason other than
//!   [`Transport::close`].
//!
//! `close()` detaches the current connection synchronously and does not emit
//! `Close`, so a cable can close and immediately reopen the same transport
//! without a late event from the old connection tearing down the new one.

pub mod fallback;
pub mod websocket;

use async_trait::async_trait;

use crate::encoder::WireData;
use crate::error::{CableError, Result};
use crate::events::{Event, EventBus};

pub use fallback::FallbackTransport;
pub use websocket::{WebSocketOptions, WebSocketTransport};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    /// The connection ended; `None` for a clean close by the server.
    Close(Option<CableError>),
    Error(CableError),
    Data(WireData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEventKind {
    Open,
    Close,
    Error,
    Data,
}

impl Event for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Open => TransportEventKind::Open,
            TransportEvent::Close(_) => TransportEventKind::Close,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::Data(_) => TransportEventKind::Data,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs, e.g. `WebSocket(wss://example.com/cable)`.
    fn display_name(&self) -> String;

    /// Establish a connection. Resolves once the transport can send.
    async fn open(&self) -> Result<()>;

    /// Queue a frame for sending. Fails if there is no open connection.
    fn send(&self, data: WireData) -> Result<()>;

    /// Detach and close the current connection, if any.
    fn close(&self) -> Result<()>;

    /// Replace the URL used by the next `open()`.
    fn set_url(&self, url: &str) -> Result<()>;

    /// Set a query parameter sent with the next `open()`.
    fn set_param(&self, key: &str, value: &str);

    fn events(&self) -> &EventBus<TransportEvent>;
}
