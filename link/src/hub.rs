//! Subscription hub: routes inbound traffic to the channels of a cable.
//!
//! The hub maps server-confirmed identifiers to local subscriptions and
//! buffers messages that arrive for an identifier before its confirmation has
//! been processed. Buffered messages are replayed in arrival order as soon as
//! the mapping is established.

pub mod queue;
pub mod subscription;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::CableError;
use crate::events::InfoEvent;
use crate::logger::Logger;
use crate::models::MessageMeta;
use crate::sync::lock;

pub use queue::Intent;
pub(crate) use subscription::Notification;
pub use subscription::{Subscription, SubscriptionState, Subscriptions};

/// Upper bound of messages buffered for one unconfirmed identifier.
pub const MAX_PENDING_MESSAGES: usize = 1024;

#[derive(Debug)]
struct PendingMessage {
    message: Value,
    meta: Option<MessageMeta>,
}

#[derive(Default)]
struct Routes {
    /// Remote identifier -> local identifier.
    remote: HashMap<String, String>,
    /// Remote identifier -> messages received before its confirmation.
    pending: HashMap<String, VecDeque<PendingMessage>>,
}

pub struct Hub {
    subscriptions: Subscriptions,
    routes: Mutex<Routes>,
    /// Held while delivering so a flush cannot interleave with live traffic.
    delivery: Mutex<()>,
    logger: Logger,
}

impl Hub {
    pub fn new(concurrent_subscribes: bool, logger: Logger) -> Self {
        Self {
            subscriptions: Subscriptions::new(concurrent_subscribes),
            routes: Mutex::new(Routes::default()),
            delivery: Mutex::new(()),
            logger,
        }
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn pending_messages(&self) -> usize {
        lock(&self.routes).pending.values().map(VecDeque::len).sum()
    }

    fn resolve(&self, remote_id: &str) -> Option<Arc<Subscription>> {
        let local = lock(&self.routes).remote.get(remote_id).cloned()?;
        self.subscriptions.get(&local)
    }

    /// The subscription confirmed under `remote_id` became live.
    pub(crate) fn subscribe(&self, subscription: &Arc<Subscription>, remote_id: String) {
        self.activate(subscription, remote_id, Notification::Connected);
    }

    /// The server kept `subscription` alive across a reconnect.
    pub(crate) fn restore(&self, subscription: &Arc<Subscription>, remote_id: String) {
        self.activate(subscription, remote_id, Notification::Restored);
    }

    fn activate(&self, subscription: &Arc<Subscription>, remote_id: String, notification: Notification) {
        let _delivery = lock(&self.delivery);
        let flushed: Vec<PendingMessage> = {
            let mut routes = lock(&self.routes);
            routes.remote.insert(remote_id.clone(), subscription.id().to_string());
            routes.pending.remove(&remote_id).map(Vec::from).unwrap_or_default()
        };
        subscription.set_remote_id(Some(remote_id));
        subscription.notify(notification);

        if !flushed.is_empty() {
            self.logger.debug(format_args!(
                "flushing {} buffered messages for {}",
                flushed.len(),
                subscription.id()
            ));
        }
        for pending in flushed {
            subscription.receive(&pending.message, pending.meta.as_ref());
        }
    }

    /// Forget the remote mapping of `subscription` without closing it.
    pub(crate) fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(remote_id) = subscription.remote_id() {
            lock(&self.routes).remote.remove(&remote_id);
        }
        subscription.set_remote_id(None);
    }

    /// Close `subscription` and drop it from the registry.
    pub(crate) fn remove(&self, subscription: &Arc<Subscription>, err: Option<CableError>) {
        self.unsubscribe(subscription);
        subscription.close(err);
        self.subscriptions.remove_if_same(subscription);
    }

    /// Deliver a broadcast, or buffer it until `remote_id` is confirmed.
    ///
    /// Each unconfirmed identifier buffers at most [`MAX_PENDING_MESSAGES`];
    /// past that its oldest message is dropped with a warning. Other
    /// identifiers are never affected. Listeners run on the caller's thread
    /// while delivery is serialized.
    pub fn transmit(&self, remote_id: &str, message: Value, meta: Option<MessageMeta>) {
        let _delivery = lock(&self.delivery);
        if let Some(subscription) = self.resolve(remote_id) {
            subscription.receive(&message, meta.as_ref());
            return;
        }

        let mut routes = lock(&self.routes);
        let queue = routes.pending.entry(remote_id.to_string()).or_default();
        if queue.len() >= MAX_PENDING_MESSAGES {
            queue.pop_front();
            self.logger.warn(format_args!(
                "pending buffer full, dropping oldest message for {}",
                remote_id
            ));
        }
        self.logger.debug(format_args!("buffering message for unknown identifier {}", remote_id));
        queue.push_back(PendingMessage { message, meta });
    }

    pub(crate) fn notify_info(&self, remote_id: &str, event: &InfoEvent) {
        match self.resolve(remote_id) {
            Some(subscription) => subscription.receive_info(event),
            None => self.logger.debug(format_args!("info for unknown identifier {}", remote_id)),
        }
    }

    pub(crate) fn notify_presence(&self, remote_id: &str, message: &Value) {
        match self.resolve(remote_id) {
            Some(subscription) => subscription.receive_presence(message),
            None => self.logger.debug(format_args!("presence for unknown identifier {}", remote_id)),
        }
    }

    /// Connection reset: buffered messages and remote mappings are dropped,
    /// subscriptions and their channels stay for resubscription.
    pub fn close(&self) {
        let mut routes = lock(&self.routes);
        routes.pending.clear();
        routes.remote.clear();
    }

    /// Terminal close: every subscription is closed and removed.
    pub(crate) fn dispose(&self, err: Option<CableError>) {
        self.close();
        for subscription in self.subscriptions.drain() {
            subscription.close(err.clone());
        }
    }
}
