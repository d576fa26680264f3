//! Per-subscription intent queue.
//!
//! Every subscribe/unsubscribe decision takes a [`Ticket`] at the moment it
//! is made, so tickets line up in call order. A ticket is acquired once all
//! tickets ahead of it are gone; a ticket that has not been acquired yet can
//! be canceled by a later opposite decision, which is how adjacent
//! subscribe/unsubscribe calls collapse instead of both reaching the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Subscribed,
    Unsubscribed,
}

struct PendingLock {
    intent: Intent,
    acquired: AtomicBool,
    canceled: AtomicBool,
}

/// FIFO of pending intent transitions for one subscription.
pub(crate) struct LockQueue {
    entries: Mutex<VecDeque<Arc<PendingLock>>>,
    changed: watch::Sender<()>,
    /// Shared across subscriptions when subscribes must not run concurrently.
    global: Option<Arc<AsyncMutex<()>>>,
}

impl LockQueue {
    pub(crate) fn new(global: Option<Arc<AsyncMutex<()>>>) -> Arc<Self> {
        let (changed, _) = watch::channel(());
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            changed,
            global,
        })
    }

    pub(crate) fn enqueue(self: &Arc<Self>, intent: Intent) -> Ticket {
        let entry = Arc::new(PendingLock {
            intent,
            acquired: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        });
        lock(&self.entries).push_back(entry.clone());
        Ticket {
            entry,
            queue: self.clone(),
        }
    }

    /// Cancel the last queued ticket if it has `intent` and has not started.
    pub(crate) fn cancel_last(&self, intent: Intent) -> bool {
        let canceled = {
            let mut entries = lock(&self.entries);
            let cancelable = entries.back().is_some_and(|last| {
                last.intent == intent && !last.acquired.load(Ordering::SeqCst)
            });
            if cancelable {
                entries.pop_back().inspect(|entry| entry.canceled.store(true, Ordering::SeqCst))
            } else {
                None
            }
        };
        if canceled.is_some() {
            self.changed.send_replace(());
        }
        canceled.is_some()
    }

    pub(crate) fn has_pending(&self, intent: Intent) -> bool {
        lock(&self.entries).iter().any(|entry| entry.intent == intent)
    }

    /// Whether a ticket with `intent` is queued but not started.
    pub(crate) fn has_waiting(&self, intent: Intent) -> bool {
        lock(&self.entries)
            .iter()
            .any(|entry| entry.intent == intent && !entry.acquired.load(Ordering::SeqCst))
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Wait until no ticket with `intent` is left in the queue.
    pub(crate) async fn drained(&self, intent: Intent) {
        let mut rx = self.changed.subscribe();
        while self.has_pending(intent) {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn is_front(&self, entry: &Arc<PendingLock>) -> bool {
        lock(&self.entries).front().is_some_and(|front| Arc::ptr_eq(front, entry))
    }

    fn remove(&self, entry: &Arc<PendingLock>) {
        lock(&self.entries).retain(|queued| !Arc::ptr_eq(queued, entry));
        self.changed.send_replace(());
    }
}

/// A queued intent transition. Dropping it leaves the queue.
pub(crate) struct Ticket {
    entry: Arc<PendingLock>,
    queue: Arc<LockQueue>,
}

impl Ticket {
    pub(crate) fn intent(&self) -> Intent {
        self.entry.intent
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.entry.canceled.load(Ordering::SeqCst)
    }

    /// Wait for every ticket queued before this one. Subscribe tickets also
    /// take the global lock when one is configured.
    pub(crate) async fn acquire(self) -> LockGuard {
        let mut rx = self.queue.changed.subscribe();
        loop {
            if self.is_canceled() {
                return LockGuard {
                    ticket: self,
                    _global: None,
                };
            }
            if self.queue.is_front(&self.entry) {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.entry.acquired.store(true, Ordering::SeqCst);

        let global = match (&self.queue.global, self.entry.intent) {
            (Some(global), Intent::Subscribed) => Some(global.clone().lock_owned().await),
            _ => None,
        };
        LockGuard {
            ticket: self,
            _global: global,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.queue.remove(&self.entry);
    }
}

/// Held while the intent transition runs.
pub(crate) struct LockGuard {
    ticket: Ticket,
    _global: Option<OwnedMutexGuard<()>>,
}

impl LockGuard {
    pub(crate) fn is_canceled(&self) -> bool {
        self.ticket.is_canceled()
    }
}
