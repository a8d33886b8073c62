//! Agent, task and workflow registries.
//!
//! The registries are the only writers of agents, tasks and workflows. Each
//! mutation runs under the per-entity locks of everything it touches, and a
//! change spanning an agent and a task is written as one unit: if the second
//! write fails, the first is rolled back.

mod agents;
mod tasks;
mod workflows;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::event::{EventType, Notification};
use codeflow_core::types::{Agent, AgentId, LogEntry, Task, TaskId, TaskStatus};
use codeflow_store::Stores;

use crate::locks::{EntityLocks, HeldLocks};
use crate::notifier::Outbound;

pub use agents::AgentRegistry;
pub use tasks::{TaskRegistry, TaskReport};
pub use workflows::WorkflowRegistry;

/// State shared by all registries.
pub(crate) struct Shared {
    pub(crate) stores: Stores,
    pub(crate) locks: EntityLocks,
    pub(crate) outbound: Outbound,
    pub(crate) logs: LogBook,
}

impl Shared {
    pub(crate) fn new(stores: Stores, outbound: Outbound, log_retention: usize) -> Self {
        Self {
            stores,
            locks: EntityLocks::new(),
            outbound,
            logs: LogBook::new(log_retention),
        }
    }

    pub(crate) async fn load_task(&self, id: &TaskId) -> Result<Task> {
        self.stores
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| CodeflowError::not_found("task", id))
    }

    pub(crate) async fn load_agent(&self, id: &AgentId) -> Result<Agent> {
        self.stores
            .agents
            .get(id)
            .await?
            .ok_or_else(|| CodeflowError::not_found("agent", id))
    }

    /// Lock a task together with the agent it is assigned to, agent first.
    ///
    /// The assignee is read before locking, so it is re-checked afterwards;
    /// if it changed in between, the locks are released and taken again.
    pub(crate) async fn lock_task_with_agent(&self, id: &TaskId) -> Result<(HeldLocks, Task)> {
        loop {
            let peek = self.load_task(id).await?;
            let agent = peek.assigned_agent_id.clone();

            let mut held = HeldLocks::default();
            if let Some(agent) = &agent {
                held.push(self.locks.agent(agent).await);
            }
            held.push(self.locks.task(id).await);

            let task = self.load_task(id).await?;
            if task.assigned_agent_id == agent {
                return Ok((held, task));
            }
        }
    }

    /// Persist a task and, optionally, its agent as one unit.
    pub(crate) async fn commit(&self, before: &Task, task: Task, agent: Option<Agent>) -> Result<()> {
        self.stores.tasks.update(task).await?;
        if let Some(agent) = agent {
            if let Err(e) = self.stores.agents.update(agent).await {
                // Leave nothing half-applied.
                if let Err(rollback) = self.stores.tasks.update(before.clone()).await {
                    tracing::error!(
                        task_id = %before.id,
                        error = %rollback,
                        "Failed to roll back task after agent write failed"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn emit_task(&self, task: &Task) {
        let event_type = match task.status {
            TaskStatus::Completed => EventType::TaskCompleted,
            TaskStatus::Failed => EventType::TaskFailed,
            _ => EventType::TaskUpdated,
        };
        self.outbound.emit(
            Notification::new(event_type, &task.id, task.status).with_payload(task_payload(task)),
        );
    }

    pub(crate) fn emit_agent(&self, agent: &Agent) {
        let payload = serde_json::json!({ "current_task_id": agent.current_task_id });
        self.outbound.emit(
            Notification::new(EventType::AgentStatus, &agent.id, agent.status).with_payload(payload),
        );
    }
}

pub(crate) fn task_payload(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "title": task.title,
        "assigned_agent_id": task.assigned_agent_id,
        "run_id": task.run_id,
        "node_id": task.node_id,
    })
}

/// Rings kept at most; the oldest ring goes first once full.
const MAX_RINGS: usize = 4096;

/// Bounded in-memory log rings, one per agent or task.
pub(crate) struct LogBook {
    retention: usize,
    max_rings: usize,
    rings: Mutex<Rings>,
}

#[derive(Default)]
struct Rings {
    by_key: HashMap<String, VecDeque<LogEntry>>,
    /// Keys in creation order.
    order: VecDeque<String>,
}

impl LogBook {
    pub(crate) fn new(retention: usize) -> Self {
        Self::with_limits(retention, MAX_RINGS)
    }

    pub(crate) fn with_limits(retention: usize, max_rings: usize) -> Self {
        Self {
            retention: retention.max(1),
            max_rings: max_rings.max(1),
            rings: Mutex::new(Rings::default()),
        }
    }

    pub(crate) fn append(&self, key: String, entry: LogEntry) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        if !rings.by_key.contains_key(&key) {
            while rings.by_key.len() >= self.max_rings {
                let Some(oldest) = rings.order.pop_front() else {
                    break;
                };
                rings.by_key.remove(&oldest);
            }
            rings.order.push_back(key.clone());
        }
        let ring = rings.by_key.entry(key).or_default();
        if ring.len() >= self.retention {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub(crate) fn entries(&self, key: &str) -> Vec<LogEntry> {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings
            .by_key
            .get(key)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn remove(&self, key: &str) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        if rings.by_key.remove(key).is_some() {
            rings.order.retain(|k| k != key);
        }
    }
}

/// Registries over one set of stores, sharing locks, logs and the notifier.
#[derive(Clone)]
pub struct Registries {
    pub agents: AgentRegistry,
    pub tasks: TaskRegistry,
    pub workflows: WorkflowRegistry,
}

impl Registries {
    pub fn new(stores: Stores, outbound: Outbound, log_retention: usize) -> Self {
        let shared = Arc::new(Shared::new(stores, outbound, log_retention));
        let tasks = TaskRegistry::new(shared.clone());
        Self {
            agents: AgentRegistry::new(shared.clone(), tasks.clone()),
            workflows: WorkflowRegistry::new(shared),
            tasks,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use codeflow_core::event::EventBus;
    use codeflow_store::Stores;

    use super::Registries;
    use crate::notifier::Outbound;

    pub(crate) fn registries() -> (Registries, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(256));
        let regs = Registries::new(Stores::memory(), Outbound::local(bus.clone()), 5);
        (regs, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeflow_core::types::LogLevel;

    #[test]
    fn test_log_ring_is_bounded() {
        let book = LogBook::new(3);
        for i in 0..5 {
            book.append("task:t1".into(), LogEntry::new(LogLevel::Info, format!("line {i}")));
        }
        let entries = book.entries("task:t1");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[2].message, "line 4");
        assert!(book.entries("task:other").is_empty());
    }

    #[test]
    fn test_log_book_drops_oldest_ring_when_full() {
        let book = LogBook::with_limits(3, 2);
        book.append("task:t1".into(), LogEntry::new(LogLevel::Info, "one"));
        book.append("task:t2".into(), LogEntry::new(LogLevel::Info, "two"));
        book.append("task:t1".into(), LogEntry::new(LogLevel::Info, "again"));
        book.append("task:t3".into(), LogEntry::new(LogLevel::Info, "three"));

        assert!(book.entries("task:t1").is_empty());
        assert_eq!(book.entries("task:t2").len(), 1);
        assert_eq!(book.entries("task:t3").len(), 1);

        book.remove("task:t2");
        book.append("task:t4".into(), LogEntry::new(LogLevel::Info, "four"));
        assert_eq!(book.entries("task:t3").len(), 1);
        assert_eq!(book.entries("task:t4").len(), 1);
    }
}
