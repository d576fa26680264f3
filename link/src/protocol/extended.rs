//! Extended Action Cable protocol (`actioncable-v1-ext-json`).
//!
//! Adds on top of the base protocol:
//! - session ids: a welcome with `sid` makes connection losses recoverable,
//!   and a welcome with `restored: true` resumes the previous session;
//! - stream positions: every broadcast's `stream_id`/`epoch`/`offset` is
//!   remembered and replayed as a history request on subscribe or restore;
//! - whispers and presence through `$`-prefixed pseudo actions;
//! - optional pong replies to server pings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CableError, Result};
use crate::events::InfoEvent;
use crate::identifier::{identifier, ChannelParams};
use crate::models::{
    ClientCommand, HistoryRequest, HistoryTimestamp, MessageType, ServerMessage, StreamPosition,
};
use crate::sync::lock;
use crate::timeouts::CableTimeouts;

use super::{ActionCableProtocol, Inbound, Protocol, ProtocolHost};

pub const WHISPER_ACTION: &str = "$whisper";
pub const PRESENCE_JOIN_ACTION: &str = "$presence:join";
pub const PRESENCE_LEAVE_ACTION: &str = "$presence:leave";
pub const PRESENCE_INFO_ACTION: &str = "$presence:info";

type PendingPresence = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    /// Unix seconds used as `since` in history requests; `None` when disabled.
    restore_since: Option<u64>,
    positions: HashMap<String, StreamPosition>,
    /// Streams seen per subscribed identifier.
    subscription_streams: HashMap<String, BTreeSet<String>>,
    pending_presence: HashMap<String, PendingPresence>,
}

pub struct ExtendedProtocol {
    base: ActionCableProtocol,
    state: Mutex<SessionState>,
    history_timestamp: HistoryTimestamp,
    send_pongs: bool,
    presence_timeout: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl ExtendedProtocol {
    pub fn new(base: ActionCableProtocol, timeouts: &CableTimeouts) -> Self {
        Self {
            base,
            state: Mutex::new(SessionState {
                restore_since: Some(now_secs()),
                ..SessionState::default()
            }),
            history_timestamp: HistoryTimestamp::Now,
            send_pongs: false,
            presence_timeout: timeouts.presence_timeout,
        }
    }

    pub fn with_history_timestamp(mut self, timestamp: HistoryTimestamp) -> Self {
        self.history_timestamp = timestamp;
        lock(&self.state).restore_since = match timestamp {
            HistoryTimestamp::Now => Some(now_secs()),
            HistoryTimestamp::At(secs) => Some(secs),
            HistoryTimestamp::Disabled => None,
        };
        self
    }

    pub fn with_pongs(mut self, send_pongs: bool) -> Self {
        self.send_pongs = send_pongs;
        self
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.state).session_id.clone()
    }

    pub fn stream_position(&self, stream_id: &str) -> Option<StreamPosition> {
        lock(&self.state).positions.get(stream_id).cloned()
    }

    /// History request for `identifier`, or `None` when there is nothing to ask for.
    pub fn history_request_for(&self, identifier: &str) -> Option<HistoryRequest> {
        let state = lock(&self.state);
        let streams: BTreeMap<String, StreamPosition> = state
            .subscription_streams
            .get(identifier)
            .map(|streams| {
                streams
                    .iter()
                    .filter_map(|id| state.positions.get(id).map(|pos| (id.clone(), pos.clone())))
                    .collect()
            })
            .unwrap_or_default();

        if streams.is_empty() && state.restore_since.is_none() {
            return None;
        }
        Some(HistoryRequest {
            since: state.restore_since,
            streams,
        })
    }

    fn track_stream(&self, identifier: &str, msg: &ServerMessage) {
        let (Some(stream_id), Some(epoch), Some(offset)) = (&msg.stream_id, &msg.epoch, msg.offset)
        else {
            return;
        };
        let mut state = lock(&self.state);
        state.positions.insert(
            stream_id.clone(),
            StreamPosition {
                epoch: epoch.clone(),
                offset,
            },
        );
        if let Some(streams) = state.subscription_streams.get_mut(identifier) {
            streams.insert(stream_id.clone());
        }
    }

    fn handle_ping(&self, host: &dyn ProtocolHost) {
        if self.history_timestamp != HistoryTimestamp::Disabled {
            lock(&self.state).restore_since = Some(now_secs());
        }
        if self.send_pongs && host.is_connected() {
            match serde_json::to_value(ClientCommand::Pong) {
                Ok(msg) => {
                    if let Err(err) = host.send(msg) {
                        self.base.logger.debug(format_args!("failed to send pong: {}", err));
                    }
                },
                Err(err) => self.base.logger.error(format_args!("failed to encode pong: {}", err)),
            }
        }
    }

    fn handle_welcome(&self, host: &dyn ProtocolHost, msg: ServerMessage) -> Inbound {
        let restored = msg.restored == Some(true);
        {
            let mut state = lock(&self.state);
            if let Some(sid) = &msg.sid {
                state.session_id = Some(sid.clone());
            }
        }

        if !restored {
            return Inbound::Welcome {
                session_id: msg.sid,
                restored: false,
                restored_ids: None,
            };
        }

        let identifiers: Vec<String> = match &msg.restored_ids {
            Some(ids) => ids.clone(),
            None => lock(&self.state).subscription_streams.keys().cloned().collect(),
        };
        self.base.logger.debug(format_args!(
            "session restored, requesting history for {} subscriptions",
            identifiers.len()
        ));
        for identifier in &identifiers {
            let Some(history) = self.history_request_for(identifier) else {
                continue;
            };
            let command = ClientCommand::History {
                identifier: identifier.clone(),
                history,
            };
            let sent = serde_json::to_value(command).map_err(CableError::from).and_then(|m| host.send(m));
            if let Err(err) = sent {
                self.base.logger.warn(format_args!(
                    "failed to request history for {}: {}",
                    identifier, err
                ));
            }
        }

        Inbound::Welcome {
            session_id: msg.sid,
            restored: true,
            restored_ids: msg.restored_ids,
        }
    }

    fn handle_presence(&self, msg: ServerMessage) -> Vec<Inbound> {
        let (Some(identifier), Some(message)) = (msg.identifier, msg.message) else {
            self.base.logger.warn(format_args!("presence message without identifier"));
            return Vec::new();
        };

        let pending = match message.get("type").and_then(Value::as_str) {
            Some("info") | Some("error") => lock(&self.state).pending_presence.remove(&identifier),
            _ => None,
        };
        if let Some(tx) = pending {
            let result = if message.get("type").and_then(Value::as_str) == Some("error") {
                Err(CableError::CommandError("presence request failed".to_string()))
            } else {
                Ok(message.clone())
            };
            let _ = tx.send(result);
        }

        vec![Inbound::Presence {
            identifier,
            message,
        }]
    }

    async fn presence_info(
        &self,
        host: &dyn ProtocolHost,
        identifier: &str,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        let rx = {
            let mut state = lock(&self.state);
            if state.pending_presence.contains_key(identifier) {
                return Err(CableError::CommandError(format!(
                    "presence info for {} is already requested",
                    identifier
                )));
            }
            let (tx, rx) = oneshot::channel();
            state.pending_presence.insert(identifier.to_string(), tx);
            rx
        };

        let command = ClientCommand::Presence {
            identifier: identifier.to_string(),
            data: payload,
        };
        if let Err(err) = serde_json::to_value(command).map_err(CableError::from).and_then(|m| host.send(m)) {
            lock(&self.state).pending_presence.remove(identifier);
            return Err(err);
        }

        match tokio::time::timeout(self.presence_timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(CableError::disconnected("presence request dropped")),
            Err(_) => {
                lock(&self.state).pending_presence.remove(identifier);
                Err(CableError::TimeoutError(format!(
                    "presence info for {} timed out",
                    identifier
                )))
            },
        }
    }
}

#[async_trait]
impl Protocol for ExtendedProtocol {
    fn name(&self) -> &'static str {
        "actioncable-v1-ext-json"
    }

    async fn subscribe(
        &self,
        host: &dyn ProtocolHost,
        channel: &str,
        params: &ChannelParams,
    ) -> Result<String> {
        let id = identifier(channel, params);
        lock(&self.state).subscription_streams.entry(id.clone()).or_default();

        self.base
            .subscribe_identifier(host, &id, || ClientCommand::Subscribe {
                identifier: id.clone(),
                history: self.history_request_for(&id),
            })
            .await
    }

    async fn unsubscribe(&self, host: &dyn ProtocolHost, identifier: &str) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if let Some(streams) = state.subscription_streams.remove(identifier) {
                for stream in streams {
                    state.positions.remove(&stream);
                }
            }
        }
        self.base.unsubscribe(host, identifier).await
    }

    async fn perform(
        &self,
        host: &dyn ProtocolHost,
        identifier: &str,
        action: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        let command = match action {
            Some(WHISPER_ACTION) => ClientCommand::Whisper {
                identifier: identifier.to_string(),
                data: payload.unwrap_or(Value::Null),
            },
            Some(PRESENCE_JOIN_ACTION) => ClientCommand::Join {
                identifier: identifier.to_string(),
                presence: payload.unwrap_or(Value::Null),
            },
            Some(PRESENCE_LEAVE_ACTION) => ClientCommand::Leave {
                identifier: identifier.to_string(),
            },
            Some(PRESENCE_INFO_ACTION) => {
                return self.presence_info(host, identifier, payload).await;
            },
            _ => return self.base.perform(host, identifier, action, payload).await,
        };

        host.send(serde_json::to_value(command)?)?;
        Ok(None)
    }

    fn receive(&self, host: &dyn ProtocolHost, msg: Value) -> Vec<Inbound> {
        if !msg.is_object() {
            self.base.logger.error(format_args!("unsupported message format: {}", msg));
            return Vec::new();
        }
        let msg: ServerMessage = match serde_json::from_value(msg) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.base.logger.error(format_args!("failed to parse message: {}", err));
                return Vec::new();
            },
        };

        match msg.kind {
            Some(MessageType::Ping) => {
                self.handle_ping(host);
                return self.base.receive_message(msg);
            },
            Some(MessageType::Disconnect) => {
                let out = self.base.receive_message(msg);
                if let Some(Inbound::Disconnect { error, .. }) = out.first() {
                    self.reject_presence(error);
                }
                return out;
            },
            Some(MessageType::ConfirmSubscription) | Some(MessageType::RejectSubscription) => {
                return self.base.receive_message(msg);
            },
            _ => {},
        }

        // Any other server traffic proves the connection is alive.
        let mut out = vec![Inbound::Keepalive(None)];
        match msg.kind {
            Some(MessageType::Welcome) => out.push(self.handle_welcome(host, msg)),
            Some(MessageType::ConfirmHistory) => out.push(Inbound::Info {
                identifier: msg.identifier,
                event: InfoEvent::new("history_received"),
            }),
            Some(MessageType::RejectHistory) => {
                self.base.logger.warn(format_args!(
                    "history not found for {}",
                    msg.identifier.as_deref().unwrap_or("<unknown>")
                ));
                out.push(Inbound::Info {
                    identifier: msg.identifier,
                    event: InfoEvent::new("history_not_found"),
                });
            },
            Some(MessageType::Presence) => out.extend(self.handle_presence(msg)),
            _ => {
                if let Some(identifier) = msg.identifier.clone() {
                    self.track_stream(&identifier, &msg);
                    let meta = msg.meta();
                    match msg.message {
                        Some(message) => out.push(Inbound::Message {
                            identifier,
                            message,
                            meta,
                        }),
                        None => self.base.logger.warn(format_args!(
                            "message without payload for {}",
                            identifier
                        )),
                    }
                } else {
                    self.base.logger.warn(format_args!("unknown message type: {:?}", msg.kind));
                }
            },
        }
        out
    }

    /// Recoverable whenever the server gave us a session id.
    fn recoverable_closure(&self, _err: &CableError) -> bool {
        lock(&self.state).session_id.is_some()
    }

    fn reset(&self, err: &CableError) {
        self.reject_presence(err);
        self.base.reset(err);
    }
}

impl ExtendedProtocol {
    fn reject_presence(&self, err: &CableError) {
        let pending: Vec<PendingPresence> = lock(&self.state)
            .pending_presence
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::protocol::testing::RecordingHost;

    fn protocol(timestamp: HistoryTimestamp) -> Arc<ExtendedProtocol> {
        let timeouts = CableTimeouts::default();
        Arc::new(
            ExtendedProtocol::new(ActionCableProtocol::new(&timeouts), &timeouts)
                .with_history_timestamp(timestamp),
        )
    }

    fn room() -> ChannelParams {
        let mut params = ChannelParams::new();
        params.insert("id".into(), json!("1"));
        params
    }

    async fn wait_for_sent(host: &RecordingHost, count: usize) {
        while host.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_session_id_makes_closure_recoverable() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = RecordingHost::new();
        let err = CableError::disconnected("transport_closed");

        assert!(!protocol.recoverable_closure(&err));
        let out = protocol.receive(&host, json!({"type": "welcome", "sid": "s-1"}));
        assert_eq!(out[0], Inbound::Keepalive(None));
        assert_eq!(
            out[1],
            Inbound::Welcome {
                session_id: Some("s-1".to_string()),
                restored: false,
                restored_ids: None
            }
        );
        assert!(protocol.recoverable_closure(&err));
        assert_eq!(protocol.session_id().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_subscribe_carries_stream_positions() {
        let protocol = protocol(HistoryTimestamp::At(1_700_000_000));
        let host = Arc::new(RecordingHost::new());
        let id = identifier("Room", &room());

        let first = {
            let (protocol, host) = (protocol.clone(), host.clone());
            tokio::spawn(async move { protocol.subscribe(host.as_ref(), "Room", &room()).await })
        };
        wait_for_sent(&host, 1).await;
        assert_eq!(
            host.sent()[0]["history"],
            json!({"since": 1_700_000_000u64, "streams": {}})
        );
        protocol.receive(host.as_ref(), json!({"type": "confirm_subscription", "identifier": id}));
        first.await.unwrap().unwrap();

        let out = protocol.receive(
            host.as_ref(),
            json!({"identifier": id, "message": {"n": 1}, "stream_id": "room_1", "epoch": "e1", "offset": 10}),
        );
        assert!(matches!(&out[1], Inbound::Message { meta: Some(meta), .. } if meta.offset == Some(10)));

        let history = protocol.history_request_for(&id).unwrap();
        assert_eq!(
            history.streams.get("room_1"),
            Some(&StreamPosition {
                epoch: "e1".to_string(),
                offset: 10
            })
        );
    }

    #[test]
    fn test_restored_welcome_requests_history() {
        let protocol = protocol(HistoryTimestamp::At(100));
        let host = RecordingHost::new();
        lock(&protocol.state).subscription_streams.insert("a".to_string(), BTreeSet::new());

        let out = protocol.receive(
            &host,
            json!({"type": "welcome", "sid": "s-2", "restored": true, "restored_ids": ["a"]}),
        );
        assert_eq!(
            out[1],
            Inbound::Welcome {
                session_id: Some("s-2".to_string()),
                restored: true,
                restored_ids: Some(vec!["a".to_string()])
            }
        );
        assert_eq!(
            host.commands("history"),
            vec![json!({"command": "history", "identifier": "a", "history": {"since": 100, "streams": {}}})]
        );
    }

    #[test]
    fn test_history_info_events() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = RecordingHost::new();

        let out = protocol.receive(&host, json!({"type": "confirm_history", "identifier": "a"}));
        assert_eq!(
            out[1],
            Inbound::Info {
                identifier: Some("a".to_string()),
                event: InfoEvent::new("history_received")
            }
        );
        let out = protocol.receive(&host, json!({"type": "reject_history", "identifier": "a"}));
        assert!(matches!(&out[1], Inbound::Info { event, .. } if event.event == "history_not_found"));
    }

    #[tokio::test]
    async fn test_whisper_and_presence_commands() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = RecordingHost::new();

        protocol
            .perform(&host, "id", Some(WHISPER_ACTION), Some(json!({"typing": true})))
            .await
            .unwrap();
        protocol
            .perform(&host, "id", Some(PRESENCE_JOIN_ACTION), Some(json!({"id": "u1"})))
            .await
            .unwrap();
        protocol.perform(&host, "id", Some(PRESENCE_LEAVE_ACTION), None).await.unwrap();

        assert_eq!(
            host.sent(),
            vec![
                json!({"command": "whisper", "identifier": "id", "data": {"typing": true}}),
                json!({"command": "join", "identifier": "id", "presence": {"id": "u1"}}),
                json!({"command": "leave", "identifier": "id"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_presence_info_single_request_in_flight() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = Arc::new(RecordingHost::new());

        let request = {
            let (protocol, host) = (protocol.clone(), host.clone());
            tokio::spawn(async move {
                protocol.perform(host.as_ref(), "id", Some(PRESENCE_INFO_ACTION), None).await
            })
        };
        wait_for_sent(&host, 1).await;
        assert_eq!(host.sent()[0], json!({"command": "presence", "identifier": "id"}));

        let duplicate = protocol
            .perform(host.as_ref(), "id", Some(PRESENCE_INFO_ACTION), None)
            .await
            .unwrap_err();
        assert!(matches!(duplicate, CableError::CommandError(_)));

        let info = json!({"type": "info", "total": 2, "records": [{"id": "u1"}, {"id": "u2"}]});
        let out = protocol.receive(
            host.as_ref(),
            json!({"type": "presence", "identifier": "id", "message": info}),
        );
        assert!(matches!(&out[1], Inbound::Presence { identifier, .. } if identifier == "id"));
        assert_eq!(request.await.unwrap().unwrap(), Some(info));
    }

    #[tokio::test]
    async fn test_reset_rejects_presence_requests() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = Arc::new(RecordingHost::new());

        let request = {
            let (protocol, host) = (protocol.clone(), host.clone());
            tokio::spawn(async move {
                protocol.perform(host.as_ref(), "id", Some(PRESENCE_INFO_ACTION), None).await
            })
        };
        wait_for_sent(&host, 1).await;

        let err = CableError::disconnected("transport_closed");
        protocol.reset(&err);
        assert_eq!(request.await.unwrap().unwrap_err(), err);
    }

    #[test]
    fn test_pong_only_when_connected() {
        let timeouts = CableTimeouts::default();
        let protocol = ExtendedProtocol::new(ActionCableProtocol::new(&timeouts), &timeouts)
            .with_pongs(true);
        let host = RecordingHost::new();

        protocol.receive(&host, json!({"type": "ping", "message": 1}));
        assert_eq!(host.commands("pong").len(), 1);

        host.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        protocol.receive(&host, json!({"type": "ping", "message": 2}));
        assert_eq!(host.commands("pong").len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_streams() {
        let protocol = protocol(HistoryTimestamp::Disabled);
        let host = RecordingHost::new();
        {
            let mut state = lock(&protocol.state);
            state.subscription_streams.insert("a".to_string(), BTreeSet::from(["s".to_string()]));
            state.positions.insert(
                "s".to_string(),
                StreamPosition {
                    epoch: "e".to_string(),
                    offset: 1,
                },
            );
        }

        protocol.unsubscribe(&host, "a").await.unwrap();
        assert!(protocol.stream_position("s").is_none());
        assert!(protocol.history_request_for("a").is_none());
        assert_eq!(host.commands("unsubscribe").len(), 1);
    }
}
