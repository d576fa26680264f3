//! Wire subscriptions shared by channels with the same identifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::channel::Channel;
use crate::error::{CableError, Result};
use crate::events::InfoEvent;
use crate::identifier::ChannelParams;
use crate::models::MessageMeta;
use crate::sync::lock;

use super::queue::{Intent, LockQueue, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// State change fanned out to every channel of a subscription.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Connecting,
    Connected,
    Restored,
    Disconnected(CableError),
    Closed(Option<CableError>),
}

struct SubscriptionCore {
    intent: Option<Intent>,
    state: SubscriptionState,
    remote_id: Option<String>,
    channels: Vec<Channel>,
    disposed: bool,
}

pub struct Subscription {
    id: String,
    channel: String,
    params: ChannelParams,
    core: Mutex<SubscriptionCore>,
    locks: Arc<LockQueue>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.core);
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("intent", &core.intent)
            .field("state", &core.state)
            .field("remote_id", &core.remote_id)
            .field("channels", &core.channels.len())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        params: ChannelParams,
        global: Option<Arc<AsyncMutex<()>>>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            params,
            core: Mutex::new(SubscriptionCore {
                intent: None,
                state: SubscriptionState::Idle,
                remote_id: None,
                channels: Vec::new(),
                disposed: false,
            }),
            locks: LockQueue::new(global),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    pub fn intent(&self) -> Option<Intent> {
        lock(&self.core).intent
    }

    pub fn state(&self) -> SubscriptionState {
        lock(&self.core).state
    }

    pub fn remote_id(&self) -> Option<String> {
        lock(&self.core).remote_id.clone()
    }

    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.core).channels.clone()
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.core).disposed
    }

    pub(crate) fn add(&self, channel: Channel) {
        let mut core = lock(&self.core);
        if !core.channels.contains(&channel) {
            core.channels.push(channel);
        }
    }

    pub(crate) fn remove(&self, channel: &Channel) {
        lock(&self.core).channels.retain(|c| c != channel);
    }

    /// Declare the subscribed intent.
    ///
    /// Returns the ticket for the subscribe command to send, or `None` when
    /// nothing has to be sent: the intent was already subscribed, or a queued
    /// unsubscribe that never started was canceled instead.
    pub(crate) fn ensure_subscribed(&self) -> Result<Option<Ticket>> {
        let mut core = lock(&self.core);
        if core.disposed {
            return Err(CableError::SubscriptionClosed(self.id.clone()));
        }
        if core.intent == Some(Intent::Subscribed) {
            return Ok(None);
        }
        core.intent = Some(Intent::Subscribed);
        if self.locks.cancel_last(Intent::Unsubscribed) {
            return Ok(None);
        }
        Ok(Some(self.locks.enqueue(Intent::Subscribed)))
    }

    /// Declare the unsubscribed intent once no channel is left.
    pub(crate) fn maybe_unsubscribe(&self) -> Option<Ticket> {
        let mut core = lock(&self.core);
        if core.disposed || !core.channels.is_empty() {
            return None;
        }
        if core.intent == Some(Intent::Unsubscribed) {
            return None;
        }
        core.intent = Some(Intent::Unsubscribed);
        if self.locks.cancel_last(Intent::Subscribed) {
            return None;
        }
        Some(self.locks.enqueue(Intent::Unsubscribed))
    }

    /// Ticket for subscribing again after a connection loss, unless one is
    /// already waiting.
    pub(crate) fn resubscribe(&self) -> Option<Ticket> {
        let core = lock(&self.core);
        if core.disposed || core.intent != Some(Intent::Subscribed) {
            return None;
        }
        if self.locks.has_waiting(Intent::Subscribed) {
            return None;
        }
        Some(self.locks.enqueue(Intent::Subscribed))
    }

    /// Wait until queued transitions towards `intent` are done.
    pub(crate) async fn pending(&self, intent: Intent) {
        self.locks.drained(intent).await
    }

    /// Subscription with nothing attached and nothing in flight.
    pub(crate) fn is_abandoned(&self) -> bool {
        let core = lock(&self.core);
        core.channels.is_empty()
            && core.intent != Some(Intent::Subscribed)
            && core.state != SubscriptionState::Connected
            && self.locks.len() == 0
    }

    pub(crate) fn set_remote_id(&self, remote_id: Option<String>) {
        lock(&self.core).remote_id = remote_id;
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        lock(&self.core).state = state;
    }

    pub(crate) fn notify(&self, notification: Notification) {
        let channels = {
            let mut core = lock(&self.core);
            core.state = match &notification {
                Notification::Connecting => SubscriptionState::Connecting,
                Notification::Connected | Notification::Restored => SubscriptionState::Connected,
                Notification::Disconnected(_) => SubscriptionState::Disconnected,
                Notification::Closed(_) => SubscriptionState::Closed,
            };
            core.channels.clone()
        };

        for channel in channels {
            match &notification {
                Notification::Connecting => channel.connecting(),
                Notification::Connected => {
                    // Channels joining a live subscription are already connected.
                    let _ = channel.connected();
                },
                Notification::Restored => {
                    if channel.restored().is_err() {
                        let _ = channel.connected();
                    }
                },
                Notification::Disconnected(err) => channel.disconnected(err.clone()),
                Notification::Closed(err) => channel.closed(err.clone()),
            }
        }
    }

    pub(crate) fn receive(&self, message: &Value, meta: Option<&MessageMeta>) {
        for channel in self.channels() {
            channel.receive(message.clone(), meta.cloned());
        }
    }

    pub(crate) fn receive_info(&self, event: &InfoEvent) {
        for channel in self.channels() {
            channel.receive_info(event.clone());
        }
    }

    pub(crate) fn receive_presence(&self, message: &Value) {
        for channel in self.channels() {
            channel.receive_presence(message.clone());
        }
    }

    /// Terminal: no further intents are accepted.
    pub(crate) fn close(&self, err: Option<CableError>) {
        {
            let mut core = lock(&self.core);
            core.disposed = true;
            core.intent = None;
            core.remote_id = None;
        }
        self.notify(Notification::Closed(err));
        lock(&self.core).channels.clear();
    }
}

/// Registry of subscriptions by local identifier.
pub struct Subscriptions {
    entries: Mutex<HashMap<String, Arc<Subscription>>>,
    global: Option<Arc<AsyncMutex<()>>>,
}

impl Subscriptions {
    pub(crate) fn new(concurrent_subscribes: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            global: (!concurrent_subscribes).then(|| Arc::new(AsyncMutex::new(()))),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        lock(&self.entries).get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Subscription>> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live subscription for `id`, replacing a disposed one.
    pub(crate) fn get_or_create(
        &self,
        id: &str,
        channel: &str,
        params: &ChannelParams,
    ) -> Arc<Subscription> {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(id) {
            if !existing.is_disposed() {
                return existing.clone();
            }
        }
        let subscription = Arc::new(Subscription::new(
            id,
            channel,
            params.clone(),
            self.global.clone(),
        ));
        entries.insert(id.to_string(), subscription.clone());
        subscription
    }

    /// Remove `subscription` unless it was already replaced.
    pub(crate) fn remove_if_same(&self, subscription: &Arc<Subscription>) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(subscription.id()) {
            Some(current) if Arc::ptr_eq(current, subscription) => {
                entries.remove(subscription.id());
                true
            },
            _ => false,
        }
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Subscription>> {
        lock(&self.entries).drain().map(|(_, sub)| sub).collect()
    }
}
