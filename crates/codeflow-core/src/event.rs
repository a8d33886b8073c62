use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of state change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "agent:metrics")]
    AgentMetrics,
    #[serde(rename = "agent:log")]
    AgentLog,
    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:failed")]
    TaskFailed,
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow:failed")]
    WorkflowFailed,
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStatus => "agent:status",
            Self::AgentMetrics => "agent:metrics",
            Self::AgentLog => "agent:log",
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::WorkflowStarted => "workflow:started",
            Self::WorkflowCompleted => "workflow:completed",
            Self::WorkflowFailed => "workflow:failed",
            Self::WorkflowCancelled => "workflow:cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("invalid event type: {s}"))
    }
}

/// One outbound state-change notification.
///
/// Notifications are status snapshots, not deltas: delivering one twice is
/// harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity_id: String,
    pub new_state: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(event_type: EventType, entity_id: impl ToString, new_state: impl ToString) -> Self {
        Self {
            event_type,
            entity_id: entity_id.to_string(),
            new_state: new_state.to_string(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Notification) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let n = Notification::new(EventType::TaskCompleted, "t-1", "completed")
            .with_payload(serde_json::json!({"run_id": "r-1"}));
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "task:completed");
        assert_eq!(v["entity_id"], "t-1");
        assert_eq!(v["new_state"], "completed");
        assert_eq!(v["payload"]["run_id"], "r-1");
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn test_event_type_names_agree() {
        for name in ["agent:status", "task:failed", "workflow:cancelled"] {
            let parsed: EventType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
        assert!("task:exploded".parse::<EventType>().is_err());
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Notification::new(EventType::AgentStatus, "a-1", "online"));
        assert_eq!(a.recv().await.unwrap().entity_id, "a-1");
        assert_eq!(b.recv().await.unwrap().new_state, "online");
    }
}
