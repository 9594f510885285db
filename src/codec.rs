//! Failure-tolerant JSON payload codec.
//!
//! The notification channel is untrusted from this process's perspective:
//! malformed payloads must never crash the receiver. Encoding falls back to
//! the literal string `null`, decoding to an empty object, with a warning
//! either way.

use serde_json::Value;
use tracing::warn;

/// Encode a payload as a JSON string.
///
/// On serialization failure the literal string `null` is returned.
pub fn pack(value: &Value, pretty: bool) -> String {
    let result = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };

    match result {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode payload, sending null: {}", e);
            "null".to_string()
        }
    }
}

/// Decode a notification payload.
///
/// `None` decodes to `Value::Null`; malformed JSON decodes to an empty
/// object so handlers always receive a value.
pub fn unpack(text: Option<&str>) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };

    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to decode payload {:?}: {}", text, e);
            Value::Object(serde_json::Map::new())
        }
    }
}
