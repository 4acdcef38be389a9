//! Per-session event broadcasters.
//!
//! The SSE layer subscribes to a session's channel; the subagent manager and
//! the `report_to_parent` tool publish into it. Publishing to a session with
//! no subscribers is a silent no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// SSE event name, e.g. "subagent_spawn".
    pub event: String,
    pub data: Value,
}

/// Registry of session-id → broadcast sender.
#[derive(Clone, Default)]
pub struct Broadcasters {
    inner: Arc<Mutex<HashMap<String, broadcast::Sender<BroadcastEvent>>>>,
}

impl Broadcasters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's events, creating the channel on first use.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<BroadcastEvent> {
        let mut map = self.inner.lock().expect("broadcasters lock");
        map.entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a session. Dropped when nobody ever subscribed.
    pub fn publish(&self, session_id: &str, event: &str, data: Value) {
        let sender = {
            let map = self.inner.lock().expect("broadcasters lock");
            map.get(session_id).cloned()
        };
        if let Some(tx) = sender {
            let _ = tx.send(BroadcastEvent {
                event: event.to_string(),
                data,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let b = Broadcasters::new();
        let mut rx = b.subscribe("sess-1");
        b.publish("sess-1", "subagent_spawn", json!({"agentId": "a1"}));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, "subagent_spawn");
        assert_eq!(ev.data["agentId"], "a1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let b = Broadcasters::new();
        b.publish("nobody", "x", json!({}));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let b = Broadcasters::new();
        let mut rx_a = b.subscribe("a");
        let _rx_b = b.subscribe("b");
        b.publish("b", "ev", json!(1));
        assert!(rx_a.try_recv().is_err());
    }
}
