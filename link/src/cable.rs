//! Cable: one logical connection shared by many channels.
//!
//! The cable owns the transport, encoder, protocol, hub and monitor. Inbound
//! frames flow transport -> encoder -> protocol -> hub -> channels; channel
//! commands flow the other way through the protocol.
//!
//! ```rust,no_run
//! use cable_link::{create_cable, CableOptions, Channel, ChannelEvent, ChannelEventKind, ChannelParams};
//!
//! # async fn example() -> cable_link::Result<()> {
//! let cable = create_cable("wss://example.com/cable", CableOptions::default())?;
//!
//! let mut params = ChannelParams::new();
//! params.insert("room".into(), "42".into());
//! let channel = Channel::new("ChatChannel", params);
//! channel.on(ChannelEventKind::Message, |event| {
//!     if let ChannelEvent::Message { message, .. } = event {
//!         println!("{}", message);
//!     }
//! });
//!
//! cable.subscribe(&channel).await?;
//! channel.perform("speak", Some(serde_json::json!({"text": "hi"}))).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::channel::{Channel, ChannelReceiver};
use crate::encoder::{Encoder, JsonEncoder, WireData};
use crate::error::{CableError, Result};
use crate::event_handlers::{Direction, EventHandlers};
use crate::events::{ConnectInfo, Event, EventBus, InfoEvent, Unbind};
use crate::hub::queue::Ticket;
use crate::hub::{Hub, Intent, Notification, Subscription, SubscriptionState, Subscriptions};
use crate::identifier::ChannelParams;
use crate::logger::Logger;
use crate::models::{CableOptions, PerformFailures};
use crate::monitor::{Monitor, MonitorTarget};
use crate::protocol::{self, Inbound, Protocol, ProtocolHost};
use crate::sync::{lock, spawn};
use crate::timeouts::CableTimeouts;
use crate::transport::{Transport, TransportEvent, WebSocketOptions, WebSocketTransport};

/// Channel name used by [`Cable::stream_from`].
pub const PUBSUB_CHANNEL: &str = "$pubsub";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableState {
    Idle,
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CableEvent {
    Connect(ConnectInfo),
    /// Unexpected connection loss; the monitor reconnects.
    Disconnect(CableError),
    /// Terminal close; no automatic reconnect.
    Close(Option<CableError>),
    Keepalive(Option<Value>),
    /// Informational message not tied to a subscription.
    Info(InfoEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableEventKind {
    Connect,
    Disconnect,
    Close,
    Keepalive,
    Info,
}

impl Event for CableEvent {
    type Kind = CableEventKind;

    fn kind(&self) -> CableEventKind {
        match self {
            CableEvent::Connect(_) => CableEventKind::Connect,
            CableEvent::Disconnect(_) => CableEventKind::Disconnect,
            CableEvent::Close(_) => CableEventKind::Close,
            CableEvent::Keepalive(_) => CableEventKind::Keepalive,
            CableEvent::Info(_) => CableEventKind::Info,
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, Result<()>>>;

struct CableCore {
    state: CableState,
    /// The last closure was classified recoverable.
    recovering: bool,
    initial_connect: bool,
    session_id: Option<String>,
    pending_connect: Option<PendingConnect>,
}

struct CableInner {
    self_ref: Weak<CableInner>,
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn Encoder>,
    protocol: Arc<dyn Protocol>,
    hub: Hub,
    monitor: Option<Monitor>,
    options: CableOptions,
    timeouts: CableTimeouts,
    logger: Logger,
    handlers: EventHandlers,
    events: EventBus<CableEvent>,
    core: Mutex<CableCore>,
}

/// Handle to a cable. Clones share the same connection.
#[derive(Clone)]
pub struct Cable {
    inner: Arc<CableInner>,
}

impl fmt::Debug for Cable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cable")
            .field("transport", &self.inner.transport.display_name())
            .field("protocol", &self.inner.protocol.name())
            .field("state", &self.state())
            .field("subscriptions", &self.inner.hub.subscriptions().len())
            .finish()
    }
}

/// Build a cable for `url` with a WebSocket transport.
pub fn create_cable(url: &str, options: CableOptions) -> Result<Cable> {
    Cable::builder().url(url).options(options).build()
}

impl Cable {
    pub fn builder() -> CableBuilder {
        CableBuilder::new()
    }

    pub fn state(&self) -> CableState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Session id assigned by the server (extended protocol).
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.core).session_id.clone()
    }

    pub fn protocol_name(&self) -> &'static str {
        self.inner.protocol.name()
    }

    pub fn options(&self) -> &CableOptions {
        &self.inner.options
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        self.inner.hub.subscriptions()
    }

    pub fn monitor(&self) -> Option<&Monitor> {
        self.inner.monitor.as_ref()
    }

    pub fn events(&self) -> &EventBus<CableEvent> {
        &self.inner.events
    }

    pub fn on(&self, kind: CableEventKind, f: impl Fn(&CableEvent) + Send + Sync + 'static) -> Unbind {
        self.inner.events.on(kind, f)
    }

    pub fn once(&self, kind: CableEventKind, f: impl Fn(&CableEvent) + Send + Sync + 'static) -> Unbind {
        self.inner.events.once(kind, f)
    }

    /// Connect, or join the connection attempt in progress.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the connection for good; every channel is closed.
    ///
    /// `Close` is emitted in every state. An idle cable stays idle.
    pub fn disconnect(&self) {
        self.inner.close(None);
    }

    /// Close with an explicit reason passed to every channel.
    pub fn close(&self, reason: Option<CableError>) {
        self.inner.close(reason);
    }

    /// Reconnect now instead of waiting for the monitor's backoff.
    pub fn reconnect_now(&self) -> bool {
        self.inner.monitor.as_ref().is_some_and(Monitor::reconnect_now)
    }

    /// Attach `channel` and subscribe it. Resolves once the server confirmed.
    pub async fn subscribe(&self, channel: &Channel) -> Result<()> {
        self.inner.subscribe(channel).await
    }

    pub async fn subscribe_to(&self, name: &str, params: ChannelParams) -> Result<Channel> {
        let channel = Channel::new(name, params);
        self.subscribe(&channel).await?;
        Ok(channel)
    }

    /// Subscribe to a named broadcast stream.
    pub async fn stream_from(&self, name: &str) -> Result<Channel> {
        let mut params = ChannelParams::new();
        params.insert("stream_name".to_string(), Value::String(name.to_string()));
        self.subscribe_to(PUBSUB_CHANNEL, params).await
    }

    /// Subscribe to a stream by its server-signed name.
    pub async fn stream_from_signed(&self, signed_name: &str) -> Result<Channel> {
        let mut params = ChannelParams::new();
        params.insert(
            "signed_stream_name".to_string(),
            Value::String(signed_name.to_string()),
        );
        self.subscribe_to(PUBSUB_CHANNEL, params).await
    }

    pub async fn unsubscribe(&self, channel: &Channel) -> Result<()> {
        self.inner.unsubscribe(channel).await
    }

    /// Perform `action` on the subscription `identifier`.
    ///
    /// Failures are handled according to [`CableOptions::perform_failures`].
    pub async fn perform(
        &self,
        identifier: &str,
        action: &str,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        self.inner.perform(identifier, Some(action), payload).await
    }
}

impl CableInner {
    fn state(&self) -> CableState {
        lock(&self.core).state
    }

    fn is_connected(&self) -> bool {
        self.state() == CableState::Connected
    }

    fn emit(&self, event: CableEvent) {
        self.handlers.dispatch(&event);
        self.events.emit(&event);
    }

    fn pending_connect(&self) -> Option<PendingConnect> {
        let core = lock(&self.core);
        match core.state {
            CableState::Connecting => core.pending_connect.clone(),
            _ => None,
        }
    }

    /// Move to `Connecting` unless connected. The flag tells whether the
    /// caller has to open the transport.
    fn begin_connect(&self) -> Option<(PendingConnect, bool)> {
        let mut core = lock(&self.core);
        match core.state {
            CableState::Connected => None,
            CableState::Connecting => core.pending_connect.clone().map(|pending| (pending, false)),
            CableState::Idle | CableState::Disconnected => {
                core.state = CableState::Connecting;
                let rx = self.events.wait_for(|event| match event {
                    CableEvent::Connect(_) => Some(Ok(())),
                    CableEvent::Disconnect(err) => Some(Err(err.clone())),
                    CableEvent::Close(err) => Some(Err(err.clone().unwrap_or(CableError::Closed))),
                    _ => None,
                });
                let pending = async move { rx.await.unwrap_or(Err(CableError::Closed)) }
                    .boxed()
                    .shared();
                core.pending_connect = Some(pending.clone());
                Some((pending, true))
            },
        }
    }

    async fn connect(&self) -> Result<()> {
        match self.begin_connect() {
            None => Ok(()),
            Some((pending, false)) => pending.await,
            Some((pending, true)) => self.open(pending).await,
        }
    }

    fn spawn_open(&self, pending: PendingConnect) {
        if let Some(cable) = self.self_ref.upgrade() {
            spawn(async move {
                if let Err(err) = cable.open(pending).await {
                    cable.logger.debug(format_args!("connect failed: {}", err));
                }
            });
        }
    }

    async fn open(&self, pending: PendingConnect) -> Result<()> {
        self.logger.info(format_args!("connecting to {}", self.transport.display_name()));
        if let Err(err) = self.transport.open().await {
            self.logger.warn(format_args!("failed to open {}: {}", self.transport.display_name(), err));
            self.disconnected(err);
        }

        let timeout = self.timeouts.connection_timeout;
        if CableTimeouts::is_unbounded(timeout) {
            return pending.await;
        }
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                let err = CableError::TimeoutError(format!("no welcome within {:?}", timeout));
                self.disconnected(err.clone());
                Err(err)
            },
        }
    }

    fn handle_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.logger.debug(format_args!("transport open: {}", self.transport.display_name()));
            },
            TransportEvent::Data(data) => self.handle_incoming(data),
            TransportEvent::Close(err) => {
                let err = err
                    .clone()
                    .unwrap_or_else(|| CableError::disconnected("transport_closed"));
                self.disconnected(err);
            },
            TransportEvent::Error(err) => {
                self.logger.warn(format_args!("transport error: {}", err));
                self.handlers.error(err);
            },
        }
    }

    fn handle_incoming(&self, data: &WireData) {
        self.handlers.frame(Direction::Inbound, data);
        let Some(msg) = self.encoder.decode(data) else {
            self.logger.error(format_args!(
                "{} failed to decode frame: {}",
                self.encoder.name(),
                data
            ));
            return;
        };

        for inbound in self.protocol.receive(self, msg) {
            self.dispatch(inbound);
        }
    }

    fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Keepalive(msg) => self.emit(CableEvent::Keepalive(msg)),
            Inbound::Welcome {
                session_id,
                restored,
                restored_ids,
            } => {
                if let Some(sid) = session_id {
                    self.transport.set_param("sid", &sid);
                    lock(&self.core).session_id = Some(sid);
                }
                if restored {
                    self.restored(restored_ids);
                } else {
                    self.connected();
                }
            },
            Inbound::Disconnect { error, reconnect } => {
                if reconnect {
                    self.disconnected(error);
                } else {
                    self.close(Some(error));
                }
            },
            Inbound::Message {
                identifier,
                message,
                meta,
            } => self.hub.transmit(&identifier, message, meta),
            Inbound::Info {
                identifier: Some(identifier),
                event,
            } => self.hub.notify_info(&identifier, &event),
            Inbound::Info {
                identifier: None,
                event,
            } => self.emit(CableEvent::Info(event)),
            Inbound::Presence {
                identifier,
                message,
            } => self.hub.notify_presence(&identifier, &message),
        }
    }

    fn connected(&self) {
        let (recovering, info) = {
            let mut core = lock(&self.core);
            if core.state != CableState::Connecting {
                self.logger.debug(format_args!("ignoring welcome in state {:?}", core.state));
                return;
            }
            core.state = CableState::Connected;
            let recovering = std::mem::take(&mut core.recovering);
            let info = ConnectInfo {
                reconnect: !core.initial_connect,
                restored: false,
            };
            core.initial_connect = false;
            (recovering, info)
        };
        self.logger.info(format_args!("connected (reconnect: {})", info.reconnect));

        let subscriptions = self.hub.subscriptions().all();
        if recovering {
            // The session was not restored: whatever was in flight is gone.
            let err = CableError::disconnected("session_not_restored");
            for subscription in &subscriptions {
                subscription.notify(Notification::Disconnected(err.clone()));
            }
        }
        for subscription in subscriptions {
            self.resubscribe(subscription);
        }
        self.emit(CableEvent::Connect(info));
    }

    fn restored(&self, restored_ids: Option<Vec<String>>) {
        let recovering = {
            let mut core = lock(&self.core);
            if core.state != CableState::Connecting {
                return;
            }
            let recovering = std::mem::take(&mut core.recovering);
            if recovering {
                core.state = CableState::Connected;
                core.initial_connect = false;
            }
            recovering
        };
        if !recovering {
            self.connected();
            return;
        }
        self.logger.info(format_args!("session restored"));

        for subscription in self.hub.subscriptions().all() {
            if subscription.intent() != Some(Intent::Subscribed) {
                continue;
            }
            let restorable = subscription.remote_id().filter(|remote_id| {
                restored_ids
                    .as_ref()
                    .is_none_or(|ids| ids.iter().any(|id| id == remote_id))
            });
            match restorable {
                Some(remote_id) => self.hub.restore(&subscription, remote_id),
                None => self.resubscribe(subscription),
            }
        }
        self.emit(CableEvent::Connect(ConnectInfo {
            reconnect: true,
            restored: true,
        }));
    }

    fn resubscribe(&self, subscription: Arc<Subscription>) {
        if let Some(ticket) = subscription.resubscribe() {
            subscription.notify(Notification::Connecting);
            self.spawn_subscribe(subscription, ticket);
        }
    }

    fn disconnected(&self, err: CableError) {
        let recovering = {
            let mut core = lock(&self.core);
            if !matches!(core.state, CableState::Connected | CableState::Connecting) {
                return;
            }
            let recovering = self.protocol.recoverable_closure(&err);
            core.state = CableState::Disconnected;
            core.recovering = recovering;
            recovering
        };
        self.logger.info(format_args!("disconnected: {} (recoverable: {})", err, recovering));

        for subscription in self.hub.subscriptions().all() {
            if recovering {
                if subscription.intent() == Some(Intent::Subscribed) {
                    subscription.notify(Notification::Connecting);
                }
            } else {
                subscription.notify(Notification::Disconnected(err.clone()));
            }
        }
        self.protocol.reset(&err);
        self.hub.close();
        if let Err(close_err) = self.transport.close() {
            self.logger.debug(format_args!("transport close failed: {}", close_err));
        }
        self.emit(CableEvent::Disconnect(err));
    }

    fn close(&self, reason: Option<CableError>) {
        {
            let mut core = lock(&self.core);
            if core.state == CableState::Idle {
                // Stays idle: a later subscribe still connects lazily.
                drop(core);
                self.emit(CableEvent::Close(reason));
                return;
            }
            core.state = CableState::Disconnected;
            core.recovering = false;
        }
        match &reason {
            Some(err) => self.logger.info(format_args!("closed: {}", err)),
            None => self.logger.info(format_args!("closed")),
        }

        let err = reason.clone().unwrap_or(CableError::Closed);
        self.protocol.reset(&err);
        self.hub.dispose(reason.clone());
        if let Err(close_err) = self.transport.close() {
            self.logger.debug(format_args!("transport close failed: {}", close_err));
        }
        self.emit(CableEvent::Close(reason));
    }

    async fn subscribe(&self, channel: &Channel) -> Result<()> {
        let receiver: Weak<dyn ChannelReceiver> = self.self_ref.clone();
        if !channel.attach(receiver)? {
            return channel.ensure_subscribed().await;
        }

        channel.connecting();
        let subscription =
            self.hub
                .subscriptions()
                .get_or_create(channel.identifier(), channel.name(), channel.params());
        subscription.add(channel.clone());

        match subscription.ensure_subscribed() {
            Ok(Some(ticket)) => self.spawn_subscribe(subscription.clone(), ticket),
            Ok(None) => {
                if subscription.state() == SubscriptionState::Connected {
                    let _ = channel.connected();
                }
            },
            Err(err) => {
                subscription.remove(channel);
                channel.closed(Some(err.clone()));
                return Err(err);
            },
        }

        if self.state() == CableState::Idle {
            if let Some((pending, true)) = self.begin_connect() {
                self.spawn_open(pending);
            }
        }
        if let Some(pending) = self.pending_connect() {
            let _ = pending.await;
        }
        if !self.is_connected() {
            return Err(CableError::NoConnection);
        }
        channel.ensure_subscribed().await
    }

    fn spawn_subscribe(&self, subscription: Arc<Subscription>, ticket: Ticket) {
        if let Some(cable) = self.self_ref.upgrade() {
            spawn(async move { cable.subscribe_task(subscription, ticket).await });
        }
    }

    async fn subscribe_task(&self, subscription: Arc<Subscription>, ticket: Ticket) {
        let guard = ticket.acquire().await;
        if guard.is_canceled() {
            if subscription.is_abandoned() {
                self.hub.remove(&subscription, None);
            }
            return;
        }
        if subscription.is_disposed() || subscription.intent() != Some(Intent::Subscribed) {
            return;
        }
        if !self.is_connected() {
            // Picked up again by `connected()`.
            self.logger.debug(format_args!("subscribe to {} deferred", subscription.id()));
            return;
        }
        if subscription.state() == SubscriptionState::Connected {
            return;
        }

        let result = self
            .protocol
            .subscribe(self, subscription.channel(), subscription.params())
            .await;
        match result {
            Ok(remote_id) => {
                self.logger.debug(format_args!("subscribed to {}", subscription.id()));
                self.hub.subscribe(&subscription, remote_id);
            },
            Err(err) if err.is_connection_error() => {
                self.logger.debug(format_args!(
                    "subscribe to {} interrupted: {}",
                    subscription.id(),
                    err
                ));
            },
            Err(err) => {
                match &err {
                    CableError::SubscriptionRejected(_) => {
                        self.logger.warn(format_args!("subscription rejected: {}", subscription.id()))
                    },
                    other => self.logger.error(format_args!(
                        "subscribe to {} failed: {}",
                        subscription.id(),
                        other
                    )),
                }
                self.hub.remove(&subscription, Some(err));
            },
        }
        drop(guard);
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<()> {
        if let Some(pending) = self.pending_connect() {
            let _ = pending.await;
        }

        let subscription = self.hub.subscriptions().get(channel.identifier());
        channel.closed(None);
        let Some(subscription) = subscription else {
            return Ok(());
        };
        subscription.remove(channel);

        let Some(ticket) = subscription.maybe_unsubscribe() else {
            if subscription.is_abandoned() {
                self.hub.remove(&subscription, None);
            }
            return Ok(());
        };
        if let Some(cable) = self.self_ref.upgrade() {
            let task = spawn(async move { cable.unsubscribe_task(subscription, ticket).await });
            if let Some(task) = task {
                task.await
                    .map_err(|e| CableError::InvalidState(format!("unsubscribe task failed: {}", e)))?;
            }
        }
        Ok(())
    }

    async fn unsubscribe_task(&self, subscription: Arc<Subscription>, ticket: Ticket) {
        let guard = ticket.acquire().await;
        if guard.is_canceled() || subscription.intent() != Some(Intent::Unsubscribed) {
            return;
        }

        let remote_id = match subscription.remote_id() {
            Some(remote_id) if self.is_connected() => remote_id,
            _ => {
                // Nothing on the server to undo.
                self.hub.remove(&subscription, None);
                return;
            },
        };
        if let Err(err) = self.protocol.unsubscribe(self, &remote_id).await {
            self.logger.warn(format_args!("unsubscribe from {} failed: {}", remote_id, err));
        }

        if subscription.intent() == Some(Intent::Unsubscribed) {
            self.hub.remove(&subscription, None);
        } else {
            // Resubscribed meanwhile; the queued subscribe starts from scratch.
            self.hub.unsubscribe(&subscription);
            subscription.set_state(SubscriptionState::Closed);
        }
        drop(guard);
    }

    async fn perform(
        &self,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        match self.perform_unchecked(identifier, action, payload).await {
            Ok(response) => Ok(response),
            Err(err) => match self.options.perform_failures {
                PerformFailures::Throw => Err(err),
                PerformFailures::Warn => {
                    self.logger.warn(format_args!(
                        "perform {} on {} failed: {}",
                        action.unwrap_or("<none>"),
                        identifier,
                        err
                    ));
                    Ok(None)
                },
                PerformFailures::Ignore => Ok(None),
            },
        }
    }

    async fn perform_unchecked(
        &self,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        if let Some(pending) = self.pending_connect() {
            let _ = pending.await;
        }
        if !self.is_connected() {
            return Err(CableError::NoConnection);
        }

        let subscription = self
            .hub
            .subscriptions()
            .get(identifier)
            .ok_or_else(|| CableError::SubscriptionClosed(identifier.to_string()))?;
        subscription.pending(Intent::Subscribed).await;
        if subscription.intent() != Some(Intent::Subscribed) {
            return Err(CableError::SubscriptionClosed(identifier.to_string()));
        }
        let remote_id = subscription
            .remote_id()
            .filter(|_| subscription.state() == SubscriptionState::Connected)
            .ok_or(CableError::NoConnection)?;

        self.protocol.perform(self, &remote_id, action, payload).await
    }
}

impl ProtocolHost for CableInner {
    fn send(&self, msg: Value) -> Result<()> {
        let data = self.encoder.encode(&msg).ok_or_else(|| {
            self.logger.error(format_args!("{} failed to encode {}", self.encoder.name(), msg));
            CableError::EncodeError(format!("{} could not encode message", self.encoder.name()))
        })?;
        self.handlers.frame(Direction::Outbound, &data);
        self.transport.send(data)
    }

    fn is_connected(&self) -> bool {
        CableInner::is_connected(self)
    }
}

#[async_trait]
impl ChannelReceiver for CableInner {
    async fn subscribe(&self, channel: &Channel) -> Result<()> {
        CableInner::subscribe(self, channel).await
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<()> {
        CableInner::unsubscribe(self, channel).await
    }

    async fn perform(
        &self,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        CableInner::perform(self, identifier, action, payload).await
    }
}

impl MonitorTarget for CableInner {
    fn events(&self) -> &EventBus<CableEvent> {
        &self.events
    }

    fn connect(&self) -> BoxFuture<'static, Result<()>> {
        let cable = self.self_ref.clone();
        async move {
            match cable.upgrade() {
                Some(cable) => cable.connect().await,
                None => Err(CableError::Closed),
            }
        }
        .boxed()
    }

    fn disconnected(&self, err: CableError) {
        CableInner::disconnected(self, err)
    }

    fn close(&self, err: CableError) {
        CableInner::close(self, Some(err))
    }
}

impl Drop for CableInner {
    fn drop(&mut self) {
        if let Some(monitor) = &self.monitor {
            monitor.dispose();
        }
        let _ = self.transport.close();
    }
}

/// Builder for [`Cable`].
pub struct CableBuilder {
    url: Option<String>,
    options: CableOptions,
    timeouts: CableTimeouts,
    transport: Option<Arc<dyn Transport>>,
    encoder: Option<Arc<dyn Encoder>>,
    protocol: Option<Arc<dyn Protocol>>,
    websocket: WebSocketOptions,
    event_handlers: EventHandlers,
}

impl Default for CableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CableBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            options: CableOptions::default(),
            timeouts: CableTimeouts::default(),
            transport: None,
            encoder: None,
            protocol: None,
            websocket: WebSocketOptions::default(),
            event_handlers: EventHandlers::default(),
        }
    }

    /// Server URL; `http(s)` is mapped to `ws(s)`.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn options(mut self, options: CableOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeouts(mut self, timeouts: CableTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Use `transport` instead of a WebSocket built from the URL.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Use `protocol` instead of the one selected by `options.protocol`.
    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Handshake headers and timeouts of the default WebSocket transport.
    pub fn websocket_options(mut self, options: WebSocketOptions) -> Self {
        self.websocket = options;
        self
    }

    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    pub fn build(self) -> Result<Cable> {
        let logger = Logger::new(self.options.log_level);
        let protocol = self
            .protocol
            .unwrap_or_else(|| protocol::from_options(&self.options, &self.timeouts, logger));

        let transport: Arc<dyn Transport> = match (self.transport, self.url) {
            (Some(transport), url) => {
                if let Some(url) = url {
                    transport.set_url(&url)?;
                }
                transport
            },
            (None, Some(url)) => {
                let options = self
                    .websocket
                    .with_subprotocol(protocol.name())
                    .with_connection_timeout(self.timeouts.connection_timeout);
                Arc::new(WebSocketTransport::new(&url, options)?)
            },
            (None, None) => {
                return Err(CableError::ConfigurationError(
                    "url is required when no transport is given".into(),
                ))
            },
        };

        if !self.options.lazy && Handle::try_current().is_err() {
            return Err(CableError::ConfigurationError(
                "a non-lazy cable must be built inside a tokio runtime".into(),
            ));
        }

        let encoder = self.encoder.unwrap_or_else(|| Arc::new(JsonEncoder));
        let monitor = self.options.monitor.as_ref().map(|options| Monitor::new(options, logger));
        let hub = Hub::new(self.options.concurrent_subscribes, logger);
        let lazy = self.options.lazy;

        let inner = Arc::new_cyclic(|self_ref| CableInner {
            self_ref: self_ref.clone(),
            transport,
            encoder,
            protocol,
            hub,
            monitor,
            options: self.options,
            timeouts: self.timeouts,
            logger,
            handlers: self.event_handlers,
            events: EventBus::new(),
            core: Mutex::new(CableCore {
                state: CableState::Idle,
                recovering: false,
                initial_connect: true,
                session_id: None,
                pending_connect: None,
            }),
        });

        let cable = Arc::downgrade(&inner);
        inner.transport.events().on_any(move |event| {
            if let Some(cable) = cable.upgrade() {
                cable.handle_transport_event(event);
            }
        });
        if let Some(monitor) = &inner.monitor {
            let target: Weak<dyn MonitorTarget> = inner.self_ref.clone();
            monitor.watch(target);
        }

        if !lazy {
            if let Some((pending, true)) = inner.begin_connect() {
                inner.spawn_open(pending);
            }
        }
        Ok(Cable { inner })
    }
}
