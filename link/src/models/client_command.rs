use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::history::HistoryRequest;

/// Client-to-server commands.
///
/// Serialized with the Action Cable `command` tag, e.g.
/// `{"command":"subscribe","identifier":"{\"channel\":\"ChatChannel\"}"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        identifier: String,
        /// Extended protocol only: replay missed messages on subscribe.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        history: Option<HistoryRequest>,
    },

    Unsubscribe {
        identifier: String,
    },

    /// Perform an action. `data` is the JSON-encoded payload string, with the
    /// action name under the `action` key.
    Message {
        identifier: String,
        data: String,
    },

    /// Extended protocol: request the history of a restored subscription.
    History {
        identifier: String,
        history: HistoryRequest,
    },

    /// Extended protocol: broadcast to the other clients of the stream
    /// without touching the server-side channel.
    Whisper {
        identifier: String,
        data: Value,
    },

    /// Extended protocol: join the channel's presence set.
    Join {
        identifier: String,
        presence: Value,
    },

    /// Extended protocol: leave the channel's presence set.
    Leave {
        identifier: String,
    },

    /// Extended protocol: request presence info.
    Presence {
        identifier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    Pong,
}

impl ClientCommand {
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ClientCommand::Subscribe { identifier, .. }
            | ClientCommand::Unsubscribe { identifier }
            | ClientCommand::Message { identifier, .. }
            | ClientCommand::History { identifier, .. }
            | ClientCommand::Whisper { identifier, .. }
            | ClientCommand::Join { identifier, .. }
            | ClientCommand::Leave { identifier }
            | ClientCommand::Presence { identifier, .. } => Some(identifier),
            ClientCommand::Pong => None,
        }
    }
}
