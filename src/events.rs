//! # Lifecycle and message events
//!
//! Events emitted by the pub/sub facade over its broadcast channel. Events
//! are tagged for JSON serialization and can be pattern-matched for handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Union of all events the pub/sub facade emits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PubSubEvent {
    /// Connection established and identity assigned
    Connect,
    /// Connection re-established after `retries` attempts
    Reconnect { retries: u32 },
    /// Connection lost
    End,
    /// Client closed
    Close,
    /// Terminal or asynchronous failure
    Error { message: String },
    /// Now the live listener for a channel
    Listen { channel: String },
    /// Stopped listening on the given channels
    Unlisten { channels: Vec<String> },
    /// Outbound notification sent
    Notify { channel: String, payload: Value },
    /// Inbound message delivered to user handlers
    Message {
        channel: String,
        payload: Value,
        received_at: DateTime<Utc>,
    },
}

impl PubSubEvent {
    /// Build a message event stamped with the current time
    pub fn message(channel: impl Into<String>, payload: Value) -> Self {
        Self::Message {
            channel: channel.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Get the event type as a string
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            PubSubEvent::Connect => "connect",
            PubSubEvent::Reconnect { .. } => "reconnect",
            PubSubEvent::End => "end",
            PubSubEvent::Close => "close",
            PubSubEvent::Error { .. } => "error",
            PubSubEvent::Listen { .. } => "listen",
            PubSubEvent::Unlisten { .. } => "unlisten",
            PubSubEvent::Notify { .. } => "notify",
            PubSubEvent::Message { .. } => "message",
        }
    }

    /// Get the channel this event concerns, if any
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            PubSubEvent::Listen { channel }
            | PubSubEvent::Notify { channel, .. }
            | PubSubEvent::Message { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type() {
        assert_eq!(PubSubEvent::Connect.event_type(), "connect");
        assert_eq!(
            PubSubEvent::Reconnect { retries: 2 }.event_type(),
            "reconnect"
        );
        assert_eq!(
            PubSubEvent::message("ch", json!(true)).event_type(),
            "message"
        );
    }

    #[test]
    fn test_channel_accessor() {
        let event = PubSubEvent::Listen {
            channel: "orders".to_string(),
        };
        assert_eq!(event.channel(), Some("orders"));
        assert_eq!(PubSubEvent::Close.channel(), None);
    }

    #[test]
    fn test_serialization_tag() {
        let event = PubSubEvent::Notify {
            channel: "orders".to_string(),
            payload: json!({"a": "b"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"notify""#));

        let back: PubSubEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
