//! Engine events
//!
//! Typed notifications for hosts (statistics UI, list manager). Delivered over
//! a `tokio::sync::broadcast` channel; publishing never blocks and is a no-op
//! while nobody subscribes. Slow subscribers see `RecvError::Lagged`.

use crate::interceptor::ResourceType;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity
pub const EVENT_CAPACITY: usize = 256;

/// Something the engine did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    RuleAdded { rule: String },
    RuleRemoved { rule: String },
    RuleToggled { rule: String, enabled: bool },
    ListAdded { id: String },
    ListRemoved { id: String },
    ListEnabled { id: String, enabled: bool },
    ListUpdated { id: String, rules: usize, changed: bool },
    ListUpdateFailed { id: String, message: String },
    ListExpired { id: String },
    WhitelistChanged { domain: String, added: bool },
    StatisticsReset,
    BlockObserved {
        request_url: String,
        source_url: String,
        /// Domain the block was counted against
        domain: String,
        kind: ResourceType,
        total_blocked: u64,
    },
    SettingsChanged,
    SettingsWriteFailed { message: String },
}

/// Broadcast hub for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        trace!("Engine event: {:?}", event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::StatisticsReset);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ListAdded { id: "a".to_string() });
        bus.emit(EngineEvent::ListRemoved { id: "a".to_string() });

        assert_eq!(rx.recv().await.unwrap(), EngineEvent::ListAdded { id: "a".to_string() });
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::ListRemoved { id: "a".to_string() });
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(EngineEvent::ListUpdateFailed {
            id: "easylist".to_string(),
            message: "timeout".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "listUpdateFailed");
        assert_eq!(json["id"], "easylist");
    }
}
