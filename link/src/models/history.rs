use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Last seen position in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub epoch: String,
    pub offset: u64,
}

/// History replay request attached to `subscribe` and `history` commands.
///
/// `since` is a unix timestamp in seconds used for streams without a known
/// position; `streams` maps stream ids to the last position seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default)]
    pub streams: BTreeMap<String, StreamPosition>,
}
