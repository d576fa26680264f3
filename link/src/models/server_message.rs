use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message_meta::MessageMeta;

/// Known values of the `type` field of server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Welcome,
    Disconnect,
    Ping,
    ConfirmSubscription,
    RejectSubscription,
    ConfirmHistory,
    RejectHistory,
    Presence,
    #[serde(other)]
    Unknown,
}

/// Server-to-client message.
///
/// Action Cable frames are loosely shaped: broadcasts carry no `type` at all,
/// only `identifier` and `message`. Every field is therefore optional and the
/// protocol decides what a frame means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    /// Broadcast payload, ping timestamp or presence payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    /// Disconnect reason (`server_restart`, `unauthorized`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Whether the client may reconnect after a `disconnect`. Absent means yes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,

    /// Session id sent with `welcome` by extended-protocol servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored: Option<bool>,

    /// Identifiers the server restored; absent means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl ServerMessage {
    /// Stream metadata attached to a broadcast, if the server sent any.
    pub fn meta(&self) -> Option<MessageMeta> {
        if self.stream_id.is_none() && self.epoch.is_none() && self.offset.is_none() {
            return None;
        }
        Some(MessageMeta {
            stream_id: self.stream_id.clone(),
            epoch: self.epoch.clone(),
            offset: self.offset,
        })
    }
}
