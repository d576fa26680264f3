//! Wire protocol strategies.
//!
//! A [`Protocol`] turns cable operations into commands and classifies inbound
//! messages into [`Inbound`] outcomes the cable acts on. It never touches the
//! transport directly: everything goes through the [`ProtocolHost`] handed to
//! each call.
//!
//! [`ActionCableProtocol`] implements plain Action Cable;
//! [`ExtendedProtocol`] wraps it and adds session recovery, stream history,
//! whispers and presence.

pub mod action_cable;
pub mod extended;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CableError, Result};
use crate::events::InfoEvent;
use crate::identifier::ChannelParams;
use crate::logger::Logger;
use crate::models::{CableOptions, MessageMeta, ProtocolVersion};
use crate::timeouts::CableTimeouts;

pub use action_cable::ActionCableProtocol;
pub use extended::ExtendedProtocol;

/// What the protocol needs from its cable.
pub trait ProtocolHost: Send + Sync {
    /// Encode and send a command.
    fn send(&self, msg: Value) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Outcome of an inbound message the cable has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Keepalive(Option<Value>),
    Welcome {
        session_id: Option<String>,
        /// The server restored the previous session.
        restored: bool,
        /// Restored identifiers; `None` means all of them.
        restored_ids: Option<Vec<String>>,
    },
    /// Server-initiated disconnect. `reconnect == false` is terminal.
    Disconnect { error: CableError, reconnect: bool },
    Message {
        identifier: String,
        message: Value,
        meta: Option<MessageMeta>,
    },
    Info {
        identifier: Option<String>,
        event: InfoEvent,
    },
    Presence { identifier: String, message: Value },
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// WebSocket subprotocol name, e.g. `actioncable-v1-json`.
    fn name(&self) -> &'static str;

    /// Subscribe and resolve with the server-confirmed identifier.
    async fn subscribe(
        &self,
        host: &dyn ProtocolHost,
        channel: &str,
        params: &ChannelParams,
    ) -> Result<String>;

    async fn unsubscribe(&self, host: &dyn ProtocolHost, identifier: &str) -> Result<()>;

    /// Perform `action` with `payload`. Only some actions produce a response.
    async fn perform(
        &self,
        host: &dyn ProtocolHost,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>>;

    /// Classify an inbound message. Messages the protocol fully handles
    /// itself (confirmations, rejections) produce no outcome.
    fn receive(&self, host: &dyn ProtocolHost, msg: Value) -> Vec<Inbound>;

    /// Whether the server may preserve subscriptions across this closure.
    fn recoverable_closure(&self, err: &CableError) -> bool;

    /// Reject everything pending with `err`.
    fn reset(&self, err: &CableError);
}

/// Build the protocol selected in `options`.
pub fn from_options(
    options: &CableOptions,
    timeouts: &CableTimeouts,
    logger: Logger,
) -> Arc<dyn Protocol> {
    let base = ActionCableProtocol::new(timeouts).with_logger(logger);
    match options.protocol {
        ProtocolVersion::ActionCableV1Json => Arc::new(base),
        ProtocolVersion::ActionCableV1ExtJson => Arc::new(
            ExtendedProtocol::new(base, timeouts)
                .with_history_timestamp(options.history_timestamp)
                .with_pongs(options.send_pongs),
        ),
    }
}
