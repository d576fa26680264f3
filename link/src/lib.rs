//! # cable-link
//!
//! Client for Action Cable compatible realtime servers (Rails Action Cable,
//! AnyCable). One [`Cable`] multiplexes any number of [`Channel`]s over a
//! single connection:
//!
//! - channels with the same identifier share one server subscription
//! - subscribe and unsubscribe requests are serialized per identifier
//! - broadcasts arriving before a confirmation are buffered and replayed
//! - a [`Monitor`] detects stale connections and reconnects with backoff
//! - the extended protocol restores sessions and fetches missed history
//!
//! ```rust,no_run
//! use cable_link::{Cable, CableOptions, ChannelEvent, ChannelEventKind, ProtocolVersion};
//!
//! # async fn example() -> cable_link::Result<()> {
//! let cable = Cable::builder()
//!     .url("wss://example.com/cable")
//!     .options(CableOptions::default().with_protocol(ProtocolVersion::ActionCableV1ExtJson))
//!     .build()?;
//!
//! let channel = cable.stream_from("chat_42").await?;
//! channel.on(ChannelEventKind::Message, |event| {
//!     if let ChannelEvent::Message { message, meta } = event {
//!         println!("{} {:?}", message, meta);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod cable;
pub mod channel;
pub mod encoder;
pub mod error;
pub mod event_handlers;
pub mod events;
pub mod hub;
pub mod identifier;
pub mod logger;
pub mod models;
pub mod monitor;
pub mod protocol;
mod sync;
pub mod timeouts;
pub mod transport;

pub use cable::{create_cable, Cable, CableBuilder, CableEvent, CableEventKind, CableState, PUBSUB_CHANNEL};
pub use channel::{Channel, ChannelEvent, ChannelEventKind, ChannelKind, ChannelReceiver, ChannelState};
pub use encoder::{Encoder, JsonEncoder, WireData};
pub use error::{CableError, Result};
pub use event_handlers::{ConnectionError, Direction, DisconnectReason, EventHandlers};
pub use events::{ConnectInfo, Event, EventBus, InfoEvent, Unbind};
pub use hub::{Hub, Intent, Subscription, SubscriptionState, Subscriptions};
pub use identifier::{identifier, ChannelParams};
pub use logger::Logger;
pub use models::{
    BackoffOptions, CableOptions, ClientCommand, HistoryRequest, HistoryTimestamp, MessageMeta,
    MessageType, MonitorOptions, PerformFailures, ProtocolVersion, ServerMessage, StreamPosition,
};
pub use monitor::{backoff_with_jitter, Monitor, MonitorState, MonitorTarget, ReconnectStrategy};
pub use protocol::{ActionCableProtocol, ExtendedProtocol, Inbound, Protocol, ProtocolHost};
pub use timeouts::{CableTimeouts, CableTimeoutsBuilder};
pub use transport::{
    FallbackTransport, Transport, TransportEvent, TransportEventKind, WebSocketOptions,
    WebSocketTransport,
};
