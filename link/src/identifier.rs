//! Deterministic channel identifiers.
//!
//! The identifier is the JSON encoding of `{"channel": <name>, ...params}`
//! with object keys sorted at every nesting level, so deep-equal params
//! always yield the same string regardless of insertion order.

use serde_json::{Map, Value};

/// Channel parameters as sent to the server.
pub type ChannelParams = Map<String, Value>;

/// Build the identifier for `channel` with `params`.
///
/// A `channel` key inside `params` overrides the channel name.
pub fn identifier(channel: &str, params: &ChannelParams) -> String {
    let mut object = Map::new();
    object.insert("channel".to_string(), Value::String(channel.to_string()));
    for (key, value) in params {
        object.insert(key.clone(), value.clone());
    }
    stable_stringify(&Value::Object(object))
}

/// JSON-encode `value` with object keys sorted recursively.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        },
        // Scalars have a single canonical encoding.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_string()).to_string());
}
