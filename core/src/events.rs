//! Lifecycle event publication.
//!
//! The engine publishes one-way events through the `FlowObserver` contract.
//! The `EventHub` implementation fans events out over a bounded broadcast
//! channel and keeps a history so late subscribers can replay everything that
//! happened before they attached.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::runstate::TaskSnapshot;

/// Maximum number of events buffered per subscriber. Slow subscribers drop
/// the oldest events rather than blocking the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FlowLoaded,
    FlowStarted,
    FlowFinished,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskLog,
}

impl EventKind {
    /// Wire name, also used as the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FlowLoaded => "flow_loaded",
            EventKind::FlowStarted => "flow_started",
            EventKind::FlowFinished => "flow_finished",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskLog => "task_log",
        }
    }
}

/// A single lifecycle event. Task payloads and results are masked before the
/// event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    pub flow_id: String,

    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowEvent {
    pub fn new(kind: EventKind, flow_id: impl Into<String>) -> Self {
        Self {
            kind,
            flow_id: flow_id.into(),
            timestamp: Utc::now(),
            task: None,
            message: None,
            error: None,
        }
    }

    pub fn with_task(mut self, task: TaskSnapshot) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// One-way event sink invoked synchronously from the engine. Implementations
/// must not block.
pub trait FlowObserver: Send + Sync {
    fn on_event(&self, event: &FlowEvent);
}

/// Observer that drops everything. Useful for tests and headless runs.
#[derive(Debug, Default)]
pub struct NullObserver;

impl FlowObserver for NullObserver {
    fn on_event(&self, _event: &FlowEvent) {}
}

/// Broadcast fan-out with history replay.
#[derive(Debug)]
pub struct EventHub {
    history: RwLock<Vec<FlowEvent>>,
    tx: broadcast::Sender<FlowEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Publish an event to history and all live subscribers. Never blocks;
    /// a send with no subscribers is not an error.
    pub fn publish(&self, event: FlowEvent) {
        self.history.write().push(event.clone());
        let _ = self.tx.send(event);
    }

    /// Subscribe, receiving the history recorded so far plus a live tail.
    /// The history copy and the receiver are taken under the same lock so no
    /// event is lost or duplicated in between.
    pub fn subscribe(&self) -> (Vec<FlowEvent>, broadcast::Receiver<FlowEvent>) {
        let history = self.history.read();
        let receiver = self.tx.subscribe();
        (history.clone(), receiver)
    }

    /// Drop historical events for the given flow id; an empty id clears all.
    pub fn clear_history(&self, flow_id: &str) {
        let mut history = self.history.write();
        if flow_id.is_empty() {
            history.clear();
        } else {
            history.retain(|event| event.flow_id != flow_id);
        }
    }

    pub fn history(&self) -> Vec<FlowEvent> {
        self.history.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl FlowObserver for EventHub {
    fn on_event(&self, event: &FlowEvent) {
        self.publish(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_shape() {
        let event = FlowEvent::new(EventKind::TaskStarted, "flow-1")
            .with_task(TaskSnapshot::pending("t1"))
            .with_message("starting");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_started");
        assert_eq!(json["flow_id"], "flow-1");
        assert_eq!(json["task"]["id"], "t1");
        assert_eq!(json["message"], "starting");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::FlowFinished.as_str(), "flow_finished");
        assert_eq!(EventKind::TaskLog.as_str(), "task_log");
    }

    #[tokio::test]
    async fn test_subscribe_replays_history_then_tails() {
        let hub = EventHub::new();
        hub.publish(FlowEvent::new(EventKind::FlowStarted, "f1"));
        hub.publish(FlowEvent::new(EventKind::TaskStarted, "f1"));

        let (history, mut rx) = hub.subscribe();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::FlowStarted);

        hub.publish(FlowEvent::new(EventKind::TaskCompleted, "f1"));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind, EventKind::TaskCompleted);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_block() {
        let hub = EventHub::new();
        for _ in 0..10 {
            hub.publish(FlowEvent::new(EventKind::TaskLog, "f1"));
        }
        assert_eq!(hub.history().len(), 10);
    }

    #[test]
    fn test_clear_history_by_flow_id() {
        let hub = EventHub::new();
        hub.publish(FlowEvent::new(EventKind::FlowStarted, "f1"));
        hub.publish(FlowEvent::new(EventKind::FlowStarted, "f2"));

        hub.clear_history("f1");
        let history = hub.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].flow_id, "f2");

        hub.clear_history("");
        assert!(hub.history().is_empty());
    }
}
