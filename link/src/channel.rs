//! Client-side channel: one subscription intent of the application.
//!
//! A [`Channel`] is a cheap handle (clone it freely); all clones share the
//! same state and listeners. Channels are attached to a cable by
//! [`Cable::subscribe`](crate::Cable::subscribe) and driven through the
//! states below by the cable's subscription hub:
//!
//! ```text
//! idle -> connecting -> connected -> disconnected -> connecting -> ...
//!                  \________________________________\-> closed
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::error::{CableError, Result};
use crate::events::{ConnectInfo, Event, EventBus, InfoEvent, Unbind};
use crate::identifier::{identifier, ChannelParams};
use crate::models::MessageMeta;
use crate::protocol::extended::WHISPER_ACTION;
use crate::sync::lock;

/// Typed channel declaration: `Channel::of::<ChatChannel>(params)`.
pub trait ChannelKind {
    /// Server-side channel class name, e.g. `ChatChannel`.
    const IDENTIFIER: &'static str;
}

/// The side a channel delegates its commands to (the cable).
#[async_trait]
pub trait ChannelReceiver: Send + Sync {
    async fn subscribe(&self, channel: &Channel) -> Result<()>;

    async fn unsubscribe(&self, channel: &Channel) -> Result<()>;

    async fn perform(
        &self,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connect(ConnectInfo),
    Disconnect(CableError),
    Close(Option<CableError>),
    Message {
        message: Value,
        meta: Option<MessageMeta>,
    },
    Info(InfoEvent),
    Presence(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventKind {
    Connect,
    Disconnect,
    Close,
    Message,
    Info,
    Presence,
}

impl Event for ChannelEvent {
    type Kind = ChannelEventKind;

    fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::Connect(_) => ChannelEventKind::Connect,
            ChannelEvent::Disconnect(_) => ChannelEventKind::Disconnect,
            ChannelEvent::Close(_) => ChannelEventKind::Close,
            ChannelEvent::Message { .. } => ChannelEventKind::Message,
            ChannelEvent::Info(_) => ChannelEventKind::Info,
            ChannelEvent::Presence(_) => ChannelEventKind::Presence,
        }
    }
}

type PendingSubscribe = Shared<BoxFuture<'static, Result<()>>>;

struct ChannelCore {
    state: ChannelState,
    initial_connect: bool,
    receiver: Option<Weak<dyn ChannelReceiver>>,
    pending_subscribe: Option<PendingSubscribe>,
}

struct ChannelInner {
    name: String,
    params: ChannelParams,
    identifier: String,
    core: Mutex<ChannelCore>,
    events: EventBus<ChannelEvent>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>, params: ChannelParams) -> Self {
        let name = name.into();
        let identifier = identifier(&name, &params);
        Self {
            inner: Arc::new(ChannelInner {
                name,
                params,
                identifier,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Idle,
                    initial_connect: true,
                    receiver: None,
                    pending_subscribe: None,
                }),
                events: EventBus::new(),
            }),
        }
    }

    pub fn of<K: ChannelKind>(params: ChannelParams) -> Self {
        Self::new(K::IDENTIFIER, params)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &ChannelParams {
        &self.inner.params
    }

    /// Deterministic identifier of `name` + `params`; channels with the same
    /// identifier share one wire subscription.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.core).state
    }

    pub fn is_attached(&self) -> bool {
        self.receiver().is_some()
    }

    pub fn events(&self) -> &EventBus<ChannelEvent> {
        &self.inner.events
    }

    /// Listen for `kind` events.
    ///
    /// Listeners run synchronously on the task reading the transport, with
    /// message delivery serialized. A listener that blocks stalls every
    /// channel of the cable; hand slow work off to a task or channel.
    pub fn on(
        &self,
        kind: ChannelEventKind,
        f: impl Fn(&ChannelEvent) + Send + Sync + 'static,
    ) -> Unbind {
        self.inner.events.on(kind, f)
    }

    /// Like [`on`](Self::on), removed after the first matching event.
    pub fn once(
        &self,
        kind: ChannelEventKind,
        f: impl Fn(&ChannelEvent) + Send + Sync + 'static,
    ) -> Unbind {
        self.inner.events.once(kind, f)
    }

    /// Subscribe again through the cable this channel is attached to.
    pub async fn connect(&self) -> Result<()> {
        let receiver = self
            .receiver()
            .ok_or_else(|| CableError::InvalidState("channel is not attached to a cable".into()))?;
        receiver.subscribe(self).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ChannelState::Connecting {
            let _ = self.ensure_subscribed().await;
        }
        if matches!(self.state(), ChannelState::Idle | ChannelState::Closed) {
            return Ok(());
        }
        match self.receiver() {
            Some(receiver) => receiver.unsubscribe(self).await,
            None => Ok(()),
        }
    }

    pub async fn perform(&self, action: &str, payload: Option<Value>) -> Result<Option<Value>> {
        self.perform_action(Some(action), payload).await
    }

    /// Perform without an action: the payload is sent as is.
    pub async fn send(&self, payload: Value) -> Result<Option<Value>> {
        self.perform_action(None, Some(payload)).await
    }

    /// Broadcast `payload` to the other subscribers of the stream without
    /// going through the server channel (extended protocol only).
    pub async fn whisper(&self, payload: Value) -> Result<()> {
        self.perform_action(Some(WHISPER_ACTION), Some(payload)).await?;
        Ok(())
    }

    /// Resolve once the channel is connected.
    ///
    /// While connecting this waits for the next `Connect` (resolves) or
    /// `Close` (rejects) event; a plain `Disconnect` keeps it waiting since
    /// the cable resubscribes on reconnect.
    pub async fn ensure_subscribed(&self) -> Result<()> {
        let pending = {
            let mut core = lock(&self.inner.core);
            match core.state {
                ChannelState::Connected => return Ok(()),
                ChannelState::Closed => {
                    return Err(CableError::SubscriptionClosed(self.inner.identifier.clone()))
                },
                ChannelState::Idle | ChannelState::Disconnected => {
                    return Err(CableError::NoConnection)
                },
                ChannelState::Connecting => self.pending_subscribe(&mut core),
            }
        };
        pending.await
    }

    async fn perform_action(
        &self,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        if self.state() == ChannelState::Connecting {
            let _ = self.ensure_subscribed().await;
        }
        if self.state() != ChannelState::Connected {
            return Err(CableError::NoConnection);
        }
        let receiver = self.receiver().ok_or(CableError::NoConnection)?;
        receiver.perform(&self.inner.identifier, action, payload).await
    }

    fn receiver(&self) -> Option<Arc<dyn ChannelReceiver>> {
        lock(&self.inner.core).receiver.as_ref().and_then(Weak::upgrade)
    }

    fn pending_subscribe(&self, core: &mut ChannelCore) -> PendingSubscribe {
        if let Some(pending) = &core.pending_subscribe {
            if pending.peek().is_none() {
                return pending.clone();
            }
        }

        let identifier = self.inner.identifier.clone();
        let rx = self.inner.events.wait_for(move |event| match event {
            ChannelEvent::Connect(_) => Some(Ok(())),
            ChannelEvent::Close(err) => Some(Err(err
                .clone()
                .unwrap_or_else(|| CableError::SubscriptionClosed(identifier.clone())))),
            _ => None,
        });
        let identifier = self.inner.identifier.clone();
        let pending = async move {
            rx.await
                .unwrap_or_else(|_| Err(CableError::SubscriptionClosed(identifier)))
        }
        .boxed()
        .shared();
        core.pending_subscribe = Some(pending.clone());
        pending
    }

    /// Attach to `receiver`. `Ok(false)` when already attached to it.
    pub(crate) fn attach(&self, receiver: Weak<dyn ChannelReceiver>) -> Result<bool> {
        let mut core = lock(&self.inner.core);
        match &core.receiver {
            Some(current) if current.strong_count() > 0 => {
                if Weak::ptr_eq(current, &receiver) {
                    Ok(false)
                } else {
                    Err(CableError::AlreadyAttached)
                }
            },
            _ => {
                core.receiver = Some(receiver);
                Ok(true)
            },
        }
    }

    pub(crate) fn connecting(&self) {
        let mut core = lock(&self.inner.core);
        if core.state == ChannelState::Closed && core.receiver.is_none() {
            return;
        }
        core.state = ChannelState::Connecting;
        // Registered now so a Connect emitted before anyone awaits is not lost.
        self.pending_subscribe(&mut core);
    }

    pub(crate) fn connected(&self) -> Result<()> {
        let info = {
            let mut core = lock(&self.inner.core);
            match core.state {
                ChannelState::Connected => {
                    return Err(CableError::InvalidState("already connected".into()))
                },
                ChannelState::Closed => return Err(CableError::InvalidState("closed".into())),
                _ => {},
            }
            core.state = ChannelState::Connected;
            let info = ConnectInfo {
                reconnect: !core.initial_connect,
                restored: false,
            };
            core.initial_connect = false;
            info
        };
        self.inner.events.emit(&ChannelEvent::Connect(info));
        Ok(())
    }

    pub(crate) fn restored(&self) -> Result<()> {
        {
            let mut core = lock(&self.inner.core);
            if core.state != ChannelState::Connecting {
                return Err(CableError::InvalidState(format!(
                    "cannot restore from {:?}",
                    core.state
                )));
            }
            core.state = ChannelState::Connected;
            core.initial_connect = false;
        }
        self.inner.events.emit(&ChannelEvent::Connect(ConnectInfo {
            reconnect: true,
            restored: true,
        }));
        Ok(())
    }

    pub(crate) fn disconnected(&self, err: CableError) {
        {
            let mut core = lock(&self.inner.core);
            if !matches!(core.state, ChannelState::Connected | ChannelState::Connecting) {
                return;
            }
            core.state = ChannelState::Disconnected;
        }
        self.inner.events.emit(&ChannelEvent::Disconnect(err));
    }

    pub(crate) fn closed(&self, err: Option<CableError>) {
        {
            let mut core = lock(&self.inner.core);
            if core.state == ChannelState::Closed {
                return;
            }
            core.state = ChannelState::Closed;
            core.receiver = None;
            core.initial_connect = true;
        }
        self.inner.events.emit(&ChannelEvent::Close(err));
    }

    pub(crate) fn receive(&self, message: Value, meta: Option<MessageMeta>) {
        self.inner.events.emit(&ChannelEvent::Message { message, meta });
    }

    pub(crate) fn receive_info(&self, event: InfoEvent) {
        self.inner.events.emit(&ChannelEvent::Info(event));
    }

    pub(crate) fn receive_presence(&self, message: Value) {
        self.inner.events.emit(&ChannelEvent::Presence(message));
    }
}
