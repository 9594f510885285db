//! Per-channel fan-out of payloads to user handlers.
//!
//! An explicit subscription registry mapping channel names to handler lists.
//! Within one channel handlers fire synchronously in registration order; no
//! ordering is specified across channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

/// Handler invoked with the channel name and decoded payload
pub type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Identifier returned by [`ChannelEmitter::on`] for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct EmitterState {
    next_id: u64,
    channels: HashMap<String, Vec<Subscription>>,
}

/// Publish/subscribe hub keyed by channel name
#[derive(Default)]
pub struct ChannelEmitter {
    state: Mutex<EmitterState>,
}

impl ChannelEmitter {
    /// Create an empty emitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a channel
    pub fn on(&self, channel: impl Into<String>, handler: Handler) -> SubscriptionId {
        self.register(channel.into(), handler, false)
    }

    /// Register a handler removed after its first invocation
    pub fn once(&self, channel: impl Into<String>, handler: Handler) -> SubscriptionId {
        self.register(channel.into(), handler, true)
    }

    fn register(&self, channel: String, handler: Handler, once: bool) -> SubscriptionId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.channels.entry(channel).or_default().push(Subscription {
            id,
            once,
            handler,
        });
        SubscriptionId(id)
    }

    /// Remove a single handler; returns whether it was present
    pub fn off(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(subs) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id.0);
        let removed = subs.len() < before;
        if subs.is_empty() {
            state.channels.remove(channel);
        }
        removed
    }

    /// Remove every handler registered for a channel
    pub fn remove_channel(&self, channel: &str) {
        self.state.lock().unwrap().channels.remove(channel);
    }

    /// Remove all handlers on all channels
    pub fn clear(&self) {
        self.state.lock().unwrap().channels.clear();
    }

    /// Number of handlers registered for a channel
    pub fn handler_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Channels with at least one handler
    pub fn channels(&self) -> Vec<String> {
        self.state.lock().unwrap().channels.keys().cloned().collect()
    }

    /// Invoke every handler registered for a channel, in registration order.
    ///
    /// One-shot handlers are dropped from the registry before invocation so
    /// a handler that re-emits cannot fire itself twice.
    pub fn emit(&self, channel: &str, payload: &Value) {
        let handlers: Vec<Handler> = {
            let mut state = self.state.lock().unwrap();
            let Some(subs) = state.channels.get_mut(channel) else {
                return;
            };
            let handlers = subs.iter().map(|s| Arc::clone(&s.handler)).collect();
            subs.retain(|s| !s.once);
            if subs.is_empty() {
                state.channels.remove(channel);
            }
            handlers
        };

        debug!(
            channel = %channel,
            handlers = handlers.len(),
            "Dispatching payload to channel handlers"
        );

        for handler in handlers {
            handler(channel, payload);
        }
    }
}

impl std::fmt::Debug for ChannelEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ChannelEmitter")
            .field("channels", &state.channels.len())
            .finish()
    }
}
