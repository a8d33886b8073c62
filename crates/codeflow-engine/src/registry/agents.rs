use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::event::{EventType, Notification};
use codeflow_core::types::{
    Agent, AgentFilter, AgentId, AgentMetrics, AgentSpec, AgentStatus, LogEntry, Task,
    TaskFilter, TaskId, TaskStatus,
};

use super::{Shared, TaskRegistry};

/// Registered agents and their reported state.
#[derive(Clone)]
pub struct AgentRegistry {
    shared: Arc<Shared>,
    tasks: TaskRegistry,
}

impl AgentRegistry {
    pub(crate) fn new(shared: Arc<Shared>, tasks: TaskRegistry) -> Self {
        Self { shared, tasks }
    }

    /// Register an agent. It starts `Offline` until it reports in.
    pub async fn register(&self, spec: AgentSpec) -> Result<Agent> {
        if spec.name.trim().is_empty() {
            return Err(CodeflowError::InvalidRequest("agent name is empty".into()));
        }
        let now = Utc::now();
        let agent = Agent {
            id: AgentId::new(),
            name: spec.name,
            agent_type: spec.agent_type,
            status: AgentStatus::Offline,
            endpoint: spec.endpoint,
            capabilities: spec.capabilities,
            current_task_id: None,
            metrics: AgentMetrics::default(),
            last_ping_at: None,
            created_at: now,
            updated_at: now,
        };
        self.shared.stores.agents.create(agent.clone()).await?;
        info!(
            agent_id = %agent.id,
            name = %agent.name,
            agent_type = %agent.agent_type,
            "Agent registered"
        );
        self.shared.emit_agent(&agent);
        Ok(agent)
    }

    pub async fn get(&self, id: &AgentId) -> Result<Agent> {
        self.shared.load_agent(id).await
    }

    pub async fn list(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        self.shared.stores.agents.list(filter).await
    }

    /// Apply a status reported by the agent.
    ///
    /// `Busy` is owned by assignment and cannot be reported. A busy agent
    /// reporting `Online` keeps its task. A busy agent going `Offline` or
    /// `Error` drops its task: an assigned task goes back to the queue, a
    /// running one fails. The released task, if any, is returned so the
    /// caller can resume its run.
    pub async fn set_status(
        &self,
        id: &AgentId,
        status: AgentStatus,
    ) -> Result<(Agent, Option<Task>)> {
        if status == AgentStatus::Busy {
            return Err(CodeflowError::InvalidRequest(
                "busy is set by assignment, not reported".into(),
            ));
        }
        let _guard = self.shared.locks.agent(id).await;
        let mut agent = self.shared.load_agent(id).await?;

        if agent.status == status {
            return Ok((agent, None));
        }

        let held_task = agent.current_task_id.clone();
        match (held_task, status) {
            (Some(task_id), AgentStatus::Online) => {
                debug!(
                    agent_id = %id,
                    task_id = %task_id,
                    "Busy agent reported online, keeping task"
                );
                Ok((agent, None))
            }
            (Some(task_id), _) => {
                let released = self.drop_task(&mut agent, &task_id, status).await?;
                Ok((agent, released))
            }
            (None, _) => {
                agent.status = status;
                agent.updated_at = Utc::now();
                self.shared.stores.agents.update(agent.clone()).await?;
                info!(agent_id = %id, status = %status, "Agent status changed");
                self.shared.emit_agent(&agent);
                Ok((agent, None))
            }
        }
    }

    /// Called with the agent lock held.
    async fn drop_task(
        &self,
        agent: &mut Agent,
        task_id: &TaskId,
        status: AgentStatus,
    ) -> Result<Option<Task>> {
        let _task_guard = self.shared.locks.task(task_id).await;
        let before = self.shared.load_task(task_id).await?;

        let now = Utc::now();
        agent.status = status;
        agent.current_task_id = None;
        agent.updated_at = now;

        if before.assigned_agent_id.as_ref() != Some(&agent.id) {
            // Stale pointer; only the agent needs fixing.
            warn!(
                agent_id = %agent.id,
                task_id = %task_id,
                "Agent pointed at a task assigned elsewhere"
            );
            self.shared.stores.agents.update(agent.clone()).await?;
            self.shared.emit_agent(agent);
            return Ok(None);
        }

        let mut task = before.clone();
        task.updated_at = now;
        match before.status {
            TaskStatus::Assigned => {
                task.status = TaskStatus::Queued;
                task.assigned_agent_id = None;
            }
            TaskStatus::Running => {
                task.status = TaskStatus::Failed;
                task.error_message = Some("agent went offline".to_string());
                task.completed_at.get_or_insert(now);
            }
            _ => {}
        }

        self.shared
            .commit(&before, task.clone(), Some(agent.clone()))
            .await?;

        warn!(
            agent_id = %agent.id,
            task_id = %task_id,
            agent_status = %status,
            task_status = %task.status,
            "Agent dropped its task"
        );
        self.shared.emit_agent(agent);
        self.shared.emit_task(&task);
        Ok(Some(task))
    }

    pub async fn update_metrics(&self, id: &AgentId, metrics: AgentMetrics) -> Result<Agent> {
        let _guard = self.shared.locks.agent(id).await;
        let mut agent = self.shared.load_agent(id).await?;
        agent.metrics = metrics;
        agent.updated_at = Utc::now();
        self.shared.stores.agents.update(agent.clone()).await?;

        let payload = serde_json::to_value(&agent.metrics)?;
        self.shared.outbound.emit(
            Notification::new(EventType::AgentMetrics, &agent.id, agent.status)
                .with_payload(payload),
        );
        Ok(agent)
    }

    /// Record a heartbeat. An offline or errored agent that pings is online
    /// again.
    pub async fn record_ping(&self, id: &AgentId) -> Result<Agent> {
        let _guard = self.shared.locks.agent(id).await;
        let mut agent = self.shared.load_agent(id).await?;
        let now = Utc::now();
        agent.last_ping_at = Some(now);
        agent.updated_at = now;
        let revived = matches!(agent.status, AgentStatus::Offline | AgentStatus::Error);
        if revived {
            agent.status = AgentStatus::Online;
        }
        self.shared.stores.agents.update(agent.clone()).await?;
        if revived {
            info!(agent_id = %id, "Agent came online");
            self.shared.emit_agent(&agent);
        }
        Ok(agent)
    }

    pub async fn append_log(&self, id: &AgentId, entry: LogEntry) -> Result<()> {
        self.shared.load_agent(id).await?;
        let payload = serde_json::to_value(&entry)?;
        self.shared.logs.append(format!("agent:{id}"), entry);
        self.shared.outbound.emit(
            Notification::new(EventType::AgentLog, id, "logged").with_payload(payload),
        );
        Ok(())
    }

    pub async fn logs(&self, id: &AgentId) -> Result<Vec<LogEntry>> {
        self.shared.load_agent(id).await?;
        Ok(self.shared.logs.entries(&format!("agent:{id}")))
    }

    /// Remove an agent. Refused while it holds a task.
    pub async fn remove(&self, id: &AgentId) -> Result<()> {
        let _guard = self.shared.locks.agent(id).await;
        let agent = self.shared.load_agent(id).await?;
        if agent.status == AgentStatus::Busy || agent.current_task_id.is_some() {
            return Err(CodeflowError::InvalidRequest(format!(
                "agent {id} is busy and cannot be removed"
            )));
        }
        self.shared.stores.agents.delete(id).await?;
        self.shared.logs.remove(&format!("agent:{id}"));
        info!(agent_id = %id, "Agent removed");
        Ok(())
    }

    /// Tasks assigned to or running on each agent.
    pub(crate) async fn loads(&self) -> Result<HashMap<AgentId, usize>> {
        let mut loads = HashMap::new();
        for status in [TaskStatus::Assigned, TaskStatus::Running] {
            let filter = TaskFilter {
                status: Some(status),
                ..Default::default()
            };
            for task in self.tasks.list(&filter).await? {
                if let Some(agent) = task.assigned_agent_id {
                    *loads.entry(agent).or_insert(0) += 1;
                }
            }
        }
        Ok(loads)
    }
}
