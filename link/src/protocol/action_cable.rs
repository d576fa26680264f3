//! Plain Action Cable protocol (`actioncable-v1-json`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CableError, Result};
use crate::event_handlers::DisconnectReason;
use crate::identifier::{identifier, ChannelParams};
use crate::logger::Logger;
use crate::models::{ClientCommand, MessageType, ServerMessage};
use crate::sync::lock;
use crate::timeouts::CableTimeouts;

use super::{Inbound, Protocol, ProtocolHost};

type PendingSubscribe = oneshot::Sender<Result<String>>;

#[derive(Default)]
struct PendingState {
    subscriptions: HashMap<String, PendingSubscribe>,
    /// When each identifier was last unsubscribed, for the resubscribe cooldown.
    unsubscribed_at: HashMap<String, Instant>,
}

enum SubscribeStep {
    Wait(Duration),
    Send(oneshot::Receiver<Result<String>>),
}

pub struct ActionCableProtocol {
    subscribe_timeout: Duration,
    subscribe_cooldown: Duration,
    pending: Mutex<PendingState>,
    pub(crate) logger: Logger,
}

impl ActionCableProtocol {
    pub fn new(timeouts: &CableTimeouts) -> Self {
        Self {
            subscribe_timeout: timeouts.subscribe_timeout,
            subscribe_cooldown: timeouts.subscribe_cooldown,
            pending: Mutex::new(PendingState::default()),
            logger: Logger::default(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Number of subscribe requests waiting for a confirmation.
    pub fn pending_subscriptions(&self) -> usize {
        lock(&self.pending).subscriptions.len()
    }

    /// Identifiers still tracked for the resubscribe cooldown.
    pub(crate) fn cooling_down(&self) -> usize {
        lock(&self.pending).unsubscribed_at.len()
    }

    /// Send a subscribe command built by `command` and wait for the answer.
    ///
    /// The command is built right before sending, after any cooldown, so
    /// callers can attach state that changes while waiting.
    pub(crate) async fn subscribe_identifier<F>(
        &self,
        host: &dyn ProtocolHost,
        identifier: &str,
        command: F,
    ) -> Result<String>
    where
        F: Fn() -> ClientCommand + Send + Sync,
    {
        let rx = loop {
            let step = {
                let mut pending = lock(&self.pending);
                let cooling_down = pending
                    .unsubscribed_at
                    .get(identifier)
                    .is_some_and(|at| at.elapsed() < self.subscribe_cooldown);

                if cooling_down {
                    SubscribeStep::Wait(self.subscribe_cooldown.mul_f64(1.5))
                } else {
                    pending.unsubscribed_at.remove(identifier);
                    if pending.subscriptions.contains_key(identifier) {
                        self.logger.error(format_args!("already subscribing to {}", identifier));
                        return Err(CableError::AlreadySubscribing(identifier.to_string()));
                    }
                    let (tx, rx) = oneshot::channel();
                    pending.subscriptions.insert(identifier.to_string(), tx);
                    SubscribeStep::Send(rx)
                }
            };

            match step {
                SubscribeStep::Wait(delay) => {
                    self.logger.debug(format_args!(
                        "unsubscribe for {} pending, delaying subscribe by {:?}",
                        identifier, delay
                    ));
                    tokio::time::sleep(delay).await;
                },
                SubscribeStep::Send(rx) => break rx,
            }
        };

        let msg = serde_json::to_value(command())?;
        self.logger.debug(format_args!("subscribing to {}", identifier));
        if let Err(err) = host.send(msg) {
            lock(&self.pending).subscriptions.remove(identifier);
            return Err(err);
        }

        match tokio::time::timeout(self.subscribe_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CableError::disconnected("subscribe request dropped")),
            Err(_) => {
                lock(&self.pending).subscriptions.remove(identifier);
                self.logger.warn(format_args!(
                    "subscribe to {} timed out after {:?}",
                    identifier, self.subscribe_timeout
                ));
                Err(CableError::SubscriptionTimeout {
                    identifier: identifier.to_string(),
                    timeout_ms: self.subscribe_timeout.as_millis() as u64,
                })
            },
        }
    }

    fn settle(&self, identifier: &str, result: Result<String>) {
        let pending = lock(&self.pending).subscriptions.remove(identifier);
        match pending {
            Some(tx) => {
                let _ = tx.send(result);
            },
            None => self.logger.error(format_args!(
                "subscription command not found for {}",
                identifier
            )),
        }
    }

    /// Handle the parsed message; shared with the extended protocol.
    pub(crate) fn receive_message(&self, msg: ServerMessage) -> Vec<Inbound> {
        match msg.kind {
            Some(MessageType::Ping) => vec![Inbound::Keepalive(msg.message)],
            Some(MessageType::Welcome) => vec![Inbound::Welcome {
                session_id: msg.sid,
                restored: false,
                restored_ids: None,
            }],
            Some(MessageType::Disconnect) => {
                let reason = msg.reason.unwrap_or_else(|| "disconnected".to_string());
                let error = CableError::Disconnected(DisconnectReason::new(reason));
                self.reset(&error);
                vec![Inbound::Disconnect {
                    error,
                    reconnect: msg.reconnect != Some(false),
                }]
            },
            Some(MessageType::ConfirmSubscription) => {
                match msg.identifier {
                    Some(identifier) => {
                        let confirmed = identifier.clone();
                        self.settle(&identifier, Ok(confirmed))
                    },
                    None => self.logger.warn(format_args!("confirmation without identifier")),
                }
                Vec::new()
            },
            Some(MessageType::RejectSubscription) => {
                match msg.identifier {
                    Some(identifier) => {
                        self.logger.warn(format_args!("subscription rejected: {}", identifier));
                        let err = CableError::SubscriptionRejected(identifier.clone());
                        self.settle(&identifier, Err(err))
                    },
                    None => self.logger.warn(format_args!("rejection without identifier")),
                }
                Vec::new()
            },
            _ => match (msg.identifier, msg.message) {
                (Some(identifier), Some(message)) => vec![Inbound::Message {
                    identifier,
                    message,
                    meta: None,
                }],
                _ => {
                    self.logger.warn(format_args!("unknown message type: {:?}", msg.kind));
                    Vec::new()
                },
            },
        }
    }
}

#[async_trait]
impl Protocol for ActionCableProtocol {
    fn name(&self) -> &'static str {
        "actioncable-v1-json"
    }

    async fn subscribe(
        &self,
        host: &dyn ProtocolHost,
        channel: &str,
        params: &ChannelParams,
    ) -> Result<String> {
        let id = identifier(channel, params);
        self.subscribe_identifier(host, &id, || ClientCommand::Subscribe {
            identifier: id.clone(),
            history: None,
        })
        .await
    }

    async fn unsubscribe(&self, host: &dyn ProtocolHost, identifier: &str) -> Result<()> {
        {
            let mut pending = lock(&self.pending);
            let cooldown = self.subscribe_cooldown;
            pending.unsubscribed_at.retain(|_, at| at.elapsed() < cooldown);
            pending.unsubscribed_at.insert(identifier.to_string(), Instant::now());
        }

        let msg = serde_json::to_value(ClientCommand::Unsubscribe {
            identifier: identifier.to_string(),
        })?;
        self.logger.debug(format_args!("unsubscribing from {}", identifier));
        host.send(msg)
    }

    async fn perform(
        &self,
        host: &dyn ProtocolHost,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        let mut data = match payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(CableError::CommandError(format!(
                    "perform payload must be a JSON object, got {}",
                    other
                )));
            },
        };
        if let Some(action) = action {
            data.insert("action".to_string(), Value::String(action.to_string()));
        }

        let msg = serde_json::to_value(ClientCommand::Message {
            identifier: identifier.to_string(),
            data: serde_json::to_string(&Value::Object(data))?,
        })?;
        host.send(msg)?;
        Ok(None)
    }

    fn receive(&self, _host: &dyn ProtocolHost, msg: Value) -> Vec<Inbound> {
        if !msg.is_object() {
            self.logger.error(format_args!("unsupported message format: {}", msg));
            return Vec::new();
        }
        match serde_json::from_value::<ServerMessage>(msg) {
            Ok(parsed) => self.receive_message(parsed),
            Err(err) => {
                self.logger.error(format_args!("failed to parse message: {}", err));
                Vec::new()
            },
        }
    }

    fn recoverable_closure(&self, _err: &CableError) -> bool {
        false
    }

    fn reset(&self, err: &CableError) {
        let pending: Vec<PendingSubscribe> = {
            let mut state = lock(&self.pending);
            state.unsubscribed_at.clear();
            state.subscriptions.drain().map(|(_, tx)| tx).collect()
        };
        if !pending.is_empty() {
            self.logger.debug(format_args!(
                "rejecting {} pending subscriptions: {}",
                pending.len(),
                err
            ));
        }
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }
}
