//! Event fan-out.
//!
//! Producers (config store, supervisor) emit through a plain callback and
//! know nothing about subscribers. The daemon wires that callback to an
//! [`EventHub`], which timestamps and logs each event and pushes it onto a
//! bounded broadcast channel. Delivery to sessions is best-effort: a slow
//! subscriber lags and drops, it never blocks the emitter.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::util::now_ts;

/// Callback handed to event producers.
pub type EventFn = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// One emitted event, as delivered to subscribed sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub ts: String,
}

pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Arc<EventHub> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(EventHub { tx })
    }

    pub fn emit(&self, kind: &str, payload: Value) {
        let event = Event {
            kind: kind.to_owned(),
            payload,
            ts: now_ts(),
        };
        info!(event = %event.kind, "event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// The callback producers emit through.
    pub fn emitter(self: &Arc<EventHub>) -> EventFn {
        let hub = self.clone();
        Arc::new(move |kind, payload| hub.emit(kind, payload))
    }
}

/// An emitter that discards everything, for components running without a hub.
pub fn null_emitter() -> EventFn {
    Arc::new(|_, _| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_reach_subscribers_with_timestamps() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emitter()("driver.exited", json!({"code": 1}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "driver.exited");
        assert_eq!(event.payload, json!({"code": 1}));
        assert!(!event.ts.is_empty());
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.emit("config.updated", json!({}));
    }
}
