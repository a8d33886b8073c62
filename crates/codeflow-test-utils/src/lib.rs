//! Fixtures shared by the Codeflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::event::{EventType, Notification};
use codeflow_core::graph::{Node, TaskTemplate, WorkflowGraph};
use codeflow_core::traits::EventChannel;
use codeflow_core::types::{AgentSpec, AgentType, RunContext};

/// Canonical graph shapes.
pub mod graphs {
    use super::*;

    pub fn task(id: &str) -> Node {
        Node::task(id, TaskTemplate::default())
    }

    /// `start → t1 → … → tn → end`.
    pub fn linear(tasks: &[&str]) -> WorkflowGraph {
        let mut nodes = Vec::with_capacity(tasks.len() + 2);
        let first = tasks.first().copied().unwrap_or("end");
        nodes.push(Node::start("start").to(first));
        for (i, id) in tasks.iter().enumerate() {
            let next = tasks.get(i + 1).copied().unwrap_or("end");
            nodes.push(task(id).to(next));
        }
        nodes.push(Node::end("end"));
        WorkflowGraph::new(nodes)
    }

    /// `start → fork → [b, c] → join → end`.
    pub fn diamond() -> WorkflowGraph {
        WorkflowGraph::new(vec![
            Node::start("start").to("fork"),
            Node::parallel("fork").to("b").to("c"),
            task("b").to("join"),
            task("c").to("join"),
            Node::join("join").to("end"),
            Node::end("end"),
        ])
    }

    /// `start → a → fork → [b, c] → join → d → end`.
    pub fn pipeline() -> WorkflowGraph {
        WorkflowGraph::new(vec![
            Node::start("start").to("a"),
            task("a").to("fork"),
            Node::parallel("fork").to("b").to("c"),
            task("b").to("join"),
            task("c").to("join"),
            Node::join("join").to("d"),
            task("d").to("end"),
            Node::end("end"),
        ])
    }

    /// `start → check → (expr true: fast | else: slow) → end`.
    pub fn branching(expr: &str) -> WorkflowGraph {
        WorkflowGraph::new(vec![
            Node::start("start").to("check"),
            Node::condition("check", expr).to("fast").to("slow"),
            task("fast").to("end"),
            task("slow").to("end"),
            Node::end("end"),
        ])
    }
}

pub fn agent_spec(name: &str, capabilities: &[&str]) -> AgentSpec {
    AgentSpec::new(name)
        .with_type(AgentType::Custom)
        .with_endpoint(format!("ws://localhost/{name}"))
        .with_capabilities(capabilities.iter().copied())
}

/// Run context from `key = json value` pairs.
pub fn context(pairs: &[(&str, serde_json::Value)]) -> RunContext {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Event channel that keeps every published notification.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<Notification>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// States reported for one entity, in delivery order.
    pub fn states_of(&self, entity_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.new_state.clone())
            .collect()
    }

    /// Poll until an event of `event_type` has been delivered.
    pub async fn wait_for(&self, event_type: EventType, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count(event_type) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count(event_type) > 0
    }
}

impl EventChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn publish(&self, event: &Notification) -> BoxFuture<'_, Result<()>> {
        let event = event.clone();
        Box::pin(async move {
            self.events.lock().unwrap().push(event);
            Ok(())
        })
    }
}

/// Event channel that is always down.
#[derive(Default)]
pub struct FailingChannel {
    attempts: AtomicUsize,
}

impl FailingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventChannel for FailingChannel {
    fn name(&self) -> &str {
        "failing"
    }

    fn publish(&self, _event: &Notification) -> BoxFuture<'_, Result<()>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(CodeflowError::Channel("channel unreachable".into())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_graphs_are_valid() {
        for graph in [
            graphs::linear(&["a", "b"]),
            graphs::linear(&[]),
            graphs::diamond(),
            graphs::pipeline(),
            graphs::branching("ready == true"),
        ] {
            let result = graph.validate();
            assert!(result.is_valid(), "{:?}", result.errors);
        }
    }

    #[tokio::test]
    async fn test_recording_channel_keeps_order() {
        let channel = RecordingChannel::new();
        channel
            .publish(&Notification::new(EventType::TaskUpdated, "t1", "assigned"))
            .await
            .unwrap();
        channel
            .publish(&Notification::new(EventType::TaskCompleted, "t1", "completed"))
            .await
            .unwrap();
        assert_eq!(channel.states_of("t1"), vec!["assigned", "completed"]);
        assert!(channel.wait_for(EventType::TaskCompleted, Duration::from_millis(10)).await);
    }
}
