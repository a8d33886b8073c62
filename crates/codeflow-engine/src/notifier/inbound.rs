use serde::{Deserialize, Serialize};
use tracing::debug;

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::types::{
    AgentId, AgentMetrics, AgentStatus, LogEntry, LogLevel, TaskId, TaskStatus,
};

use crate::engine::Engine;
use crate::registry::TaskReport;

/// A report sent by an agent, as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "agent:status")]
    Status {
        agent_id: AgentId,
        status: AgentStatus,
    },
    #[serde(rename = "agent:ping")]
    Ping { agent_id: AgentId },
    #[serde(rename = "agent:metrics")]
    Metrics {
        agent_id: AgentId,
        metrics: AgentMetrics,
    },
    #[serde(rename = "agent:log")]
    Log {
        agent_id: AgentId,
        #[serde(default)]
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "task:status")]
    TaskUpdate {
        agent_id: AgentId,
        task_id: TaskId,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Applies agent reports through the registries, then lets the engine react.
///
/// Registry locks are released before the engine is called.
#[derive(Clone)]
pub struct InboundRouter {
    engine: Engine,
}

impl InboundRouter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn handle_text(&self, text: &str) -> Result<()> {
        let message: InboundMessage = serde_json::from_str(text)?;
        self.handle(message).await
    }

    pub async fn handle(&self, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Status { agent_id, status } => {
                let (agent, released) = self.engine.agents().set_status(&agent_id, status).await?;
                if let Some(task) = released {
                    self.engine.on_task_updated(&task.id).await?;
                }
                if agent.is_available() {
                    self.engine.dispatch_pending().await?;
                }
            }
            InboundMessage::Ping { agent_id } => {
                let agent = self.engine.agents().record_ping(&agent_id).await?;
                if agent.is_available() {
                    self.engine.dispatch_pending().await?;
                }
            }
            InboundMessage::Metrics { agent_id, metrics } => {
                self.engine.agents().update_metrics(&agent_id, metrics).await?;
            }
            InboundMessage::Log {
                agent_id,
                level,
                message,
                task_id,
                metadata,
            } => {
                let mut entry = LogEntry::new(level, message);
                entry.metadata = metadata;
                if let Some(task_id) = &task_id {
                    self.engine.tasks().append_log(task_id, entry.clone()).await?;
                }
                self.engine.agents().append_log(&agent_id, entry).await?;
            }
            InboundMessage::TaskUpdate {
                agent_id,
                task_id,
                status,
                output,
                error,
            } => {
                // Agents report progress only; requeueing and assignment belong to the engine.
                if !matches!(
                    status,
                    TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed
                ) {
                    return Err(CodeflowError::InvalidRequest(format!(
                        "agent {agent_id} cannot report task {task_id} as {status}"
                    )));
                }
                let task = self.engine.tasks().get(&task_id).await?;
                if task.assigned_agent_id.as_ref() != Some(&agent_id) {
                    return Err(CodeflowError::InvalidRequest(format!(
                        "task {task_id} is not assigned to agent {agent_id}"
                    )));
                }
                if task.status == status {
                    // Redelivered report.
                    debug!(task_id = %task_id, status = %status, "Duplicate task report ignored");
                    return Ok(());
                }
                self.engine
                    .tasks()
                    .transition_with(&task_id, status, TaskReport { output, error })
                    .await?;
                self.engine.on_task_updated(&task_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use codeflow_core::config::EngineConfig;
    use codeflow_core::event::EventBus;
    use codeflow_core::graph::{Node, TaskTemplate, WorkflowGraph};
    use codeflow_core::types::{AgentSpec, RunContext, RunStatus, WorkflowSpec, WorkflowStatus};
    use codeflow_store::Stores;

    use crate::notifier::Outbound;

    async fn one_task_run(engine: &Engine) -> (AgentId, TaskId) {
        let agent = engine.agents().register(AgentSpec::new("coder")).await.unwrap();
        let router = InboundRouter::new(engine.clone());
        router
            .handle(InboundMessage::Status {
                agent_id: agent.id.clone(),
                status: AgentStatus::Online,
            })
            .await
            .unwrap();

        let graph = WorkflowGraph::new(vec![
            Node::start("s").to("a"),
            Node::task("a", TaskTemplate::default()).to("e"),
            Node::end("e"),
        ]);
        let (wf, _) = engine
            .workflows()
            .create(WorkflowSpec::new("one", graph))
            .await
            .unwrap();
        engine
            .workflows()
            .set_status(&wf.id, WorkflowStatus::Active)
            .await
            .unwrap();
        let run = engine.submit_run(&wf.id, RunContext::new()).await.unwrap();
        let snapshot = engine.frontier(&run.id).await.unwrap();
        (agent.id, snapshot.active[0].task_id.clone().unwrap())
    }

    fn engine() -> Engine {
        let bus = Arc::new(EventBus::new(256));
        Engine::new(Stores::memory(), Outbound::local(bus), EngineConfig::default())
    }

    #[test]
    fn test_parse_wire_messages() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"task:status","agent_id":"a1","task_id":"t1","status":"completed","output":"done"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::TaskUpdate {
                agent_id: AgentId::from("a1"),
                task_id: TaskId::from("t1"),
                status: TaskStatus::Completed,
                output: Some("done".into()),
                error: None,
            }
        );

        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"agent:log","agent_id":"a1","message":"hi"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Log { level: LogLevel::Info, .. }));

        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"agent:dance"}"#).is_err());
    }

    #[tokio::test]
    async fn test_task_report_drives_run() {
        let engine = engine();
        let router = InboundRouter::new(engine.clone());
        let (agent, task) = one_task_run(&engine).await;

        for status in ["running", "completed"] {
            let text = format!(
                r#"{{"type":"task:status","agent_id":"{agent}","task_id":"{task}","status":"{status}"}}"#
            );
            router.handle_text(&text).await.unwrap();
        }

        let task = engine.tasks().get(&task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let runs = engine.list_runs(None).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
        let agent = engine.agents().get(&agent).await.unwrap();
        assert!(agent.is_available());
    }

    #[tokio::test]
    async fn test_report_from_wrong_agent_rejected() {
        let engine = engine();
        let router = InboundRouter::new(engine.clone());
        let (_, task) = one_task_run(&engine).await;

        let err = router
            .handle(InboundMessage::TaskUpdate {
                agent_id: AgentId::from("impostor"),
                task_id: task.clone(),
                status: TaskStatus::Running,
                output: None,
                error: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CodeflowError::InvalidRequest(_)));
        let task = engine.tasks().get(&task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_duplicate_report_is_idempotent() {
        let engine = engine();
        let router = InboundRouter::new(engine.clone());
        let (agent, task) = one_task_run(&engine).await;

        let running = InboundMessage::TaskUpdate {
            agent_id: agent.clone(),
            task_id: task.clone(),
            status: TaskStatus::Running,
            output: None,
            error: None,
        };
        router.handle(running.clone()).await.unwrap();
        router.handle(running).await.unwrap();
        let task = engine.tasks().get(&task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_agent_dropping_out_fails_running_task() {
        let engine = engine();
        let router = InboundRouter::new(engine.clone());
        let (agent, task) = one_task_run(&engine).await;

        router
            .handle(InboundMessage::TaskUpdate {
                agent_id: agent.clone(),
                task_id: task.clone(),
                status: TaskStatus::Running,
                output: None,
                error: None,
            })
            .await
            .unwrap();
        router
            .handle(InboundMessage::Status {
                agent_id: agent,
                status: AgentStatus::Offline,
            })
            .await
            .unwrap();

        let task = engine.tasks().get(&task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let runs = engine.list_runs(None).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("agent went offline"));
    }

    #[tokio::test]
    async fn test_log_lands_on_agent_and_task() {
        let engine = engine();
        let router = InboundRouter::new(engine.clone());
        let (agent, task) = one_task_run(&engine).await;

        router
            .handle(InboundMessage::Log {
                agent_id: agent.clone(),
                level: LogLevel::Warn,
                message: "tests are slow".into(),
                task_id: Some(task.clone()),
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(engine.agents().logs(&agent).await.unwrap().len(), 1);
        let logs = engine.tasks().logs(&task).await.unwrap();
        assert_eq!(logs[0].level, LogLevel::Warn);
    }
}
