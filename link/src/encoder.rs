//! Message encoding between JSON values and transport frames.
//!
//! Encoders never fail loudly: `None` means the message could not be
//! encoded or decoded, and the cable logs and drops it.

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

/// A single frame as carried by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireData {
    Text(String),
    Binary(Bytes),
}

impl WireData {
    /// Text view of the frame for debug hooks; binary frames are shown lossily.
    pub fn as_text_lossy(&self) -> String {
        match self {
            WireData::Text(text) => text.clone(),
            WireData::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WireData::Text(text) => text.len(),
            WireData::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for WireData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireData::Text(text) => f.write_str(text),
            WireData::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

pub trait Encoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode(&self, msg: &Value) -> Option<WireData>;

    fn decode(&self, raw: &WireData) -> Option<Value>;
}

/// JSON text frames. Binary frames are decoded as UTF-8 JSON as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, msg: &Value) -> Option<WireData> {
        serde_json::to_string(msg).ok().map(WireData::Text)
    }

    fn decode(&self, raw: &WireData) -> Option<Value> {
        match raw {
            WireData::Text(text) => serde_json::from_str(text).ok(),
            WireData::Binary(bytes) => serde_json::from_slice(bytes).ok(),
        }
    }
}
