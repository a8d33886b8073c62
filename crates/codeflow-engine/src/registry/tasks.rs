use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::event::{EventType, Notification};
use codeflow_core::types::{
    Agent, AgentId, AgentStatus, AssignmentMethod, LogEntry, Task, TaskFilter, TaskId, TaskSpec,
    TaskStatus,
};

use super::Shared;

/// What an agent reported alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Task lifecycle and assignment.
#[derive(Clone)]
pub struct TaskRegistry {
    shared: Arc<Shared>,
}

impl TaskRegistry {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Create a task. It always starts `Queued`.
    ///
    /// Every dependency and the parent must exist; the new task is added to
    /// the parent's subtasks.
    pub async fn create(&self, spec: TaskSpec) -> Result<Task> {
        self.create_with_method(spec, None).await
    }

    /// Create a task remembering how it should be assigned later.
    pub(crate) async fn create_with_method(
        &self,
        spec: TaskSpec,
        method: Option<AssignmentMethod>,
    ) -> Result<Task> {
        if spec.title.trim().is_empty() {
            return Err(CodeflowError::InvalidRequest("task title is empty".into()));
        }
        for dep in &spec.depends_on {
            self.shared.load_task(dep).await?;
        }

        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Queued,
            priority: spec.priority,
            assigned_agent_id: None,
            assignment_method: method,
            parent_task_id: spec.parent_task_id.clone(),
            subtasks: Default::default(),
            depends_on: spec.depends_on,
            required_capabilities: spec.required_capabilities,
            optional: spec.optional,
            files: spec.files,
            workflow_id: spec.workflow_id,
            run_id: spec.run_id,
            node_id: spec.node_id,
            output: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        match &spec.parent_task_id {
            Some(parent_id) => {
                let _guard = self.shared.locks.task(parent_id).await;
                let mut parent = self.shared.load_task(parent_id).await?;
                self.shared.stores.tasks.create(task.clone()).await?;
                parent.subtasks.insert(task.id.clone());
                parent.updated_at = now;
                if let Err(e) = self.shared.stores.tasks.update(parent).await {
                    if let Err(undo) = self.shared.stores.tasks.delete(&task.id).await {
                        warn!(
                            task_id = %task.id,
                            parent_id = %parent_id,
                            error = %undo,
                            "Failed to roll back subtask creation"
                        );
                    }
                    return Err(e);
                }
            }
            None => self.shared.stores.tasks.create(task.clone()).await?,
        }

        debug!(task_id = %task.id, title = %task.title, "Task created");
        self.shared.outbound.emit(
            Notification::new(EventType::TaskCreated, &task.id, task.status)
                .with_payload(super::task_payload(&task)),
        );
        Ok(task)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task> {
        self.shared.load_task(id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.shared.stores.tasks.list(filter).await
    }

    /// Tasks grouped by status, every status present, each group ordered by
    /// priority then age.
    pub async fn by_status(&self) -> Result<BTreeMap<String, Vec<Task>>> {
        let mut groups: BTreeMap<String, Vec<Task>> = TaskStatus::ALL
            .iter()
            .map(|s| (s.to_string(), Vec::new()))
            .collect();
        for task in self.list(&TaskFilter::default()).await? {
            groups.entry(task.status.to_string()).or_default().push(task);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
        }
        Ok(groups)
    }

    /// Move a task along the state machine.
    ///
    /// `Queued → Assigned` is refused: it needs an agent, see [`assign`].
    /// Entering `Running` requires every dependency to be `Completed`.
    /// Entering `Completed`/`Failed`, or unassigning, frees the agent in the
    /// same step.
    ///
    /// [`assign`]: Self::assign
    pub async fn transition(&self, id: &TaskId, to: TaskStatus) -> Result<Task> {
        self.transition_with(id, to, TaskReport::default()).await
    }

    /// [`transition`](Self::transition), recording output or an error
    /// message reported with the change.
    pub async fn transition_with(
        &self,
        id: &TaskId,
        to: TaskStatus,
        report: TaskReport,
    ) -> Result<Task> {
        let (_held, before) = self.shared.lock_task_with_agent(id).await?;

        if !before.status.can_transition_to(to) {
            return Err(CodeflowError::IllegalTransition {
                task: id.clone(),
                from: before.status,
                to,
            });
        }
        if to == TaskStatus::Assigned {
            return Err(CodeflowError::AssignmentRequired(id.clone()));
        }
        if to == TaskStatus::Running {
            let pending = self.pending_dependencies(&before).await?;
            if !pending.is_empty() {
                return Err(CodeflowError::DependenciesIncomplete {
                    task: id.clone(),
                    pending,
                });
            }
        }

        let now = Utc::now();
        let mut task = before.clone();
        task.status = to;
        task.updated_at = now;
        if report.output.is_some() {
            task.output = report.output;
        }
        if report.error.is_some() {
            task.error_message = report.error;
        }
        match to {
            TaskStatus::Running => {
                task.started_at.get_or_insert(now);
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                task.completed_at.get_or_insert(now);
            }
            TaskStatus::Queued | TaskStatus::Assigned => {}
        }

        // Finishing or requeueing gives the agent back.
        let mut agent = None;
        if to.is_finished() || to == TaskStatus::Queued {
            if let Some(agent_id) = task.assigned_agent_id.clone() {
                agent = self.release_agent(&agent_id, id).await?;
            }
        }
        if to == TaskStatus::Queued {
            task.assigned_agent_id = None;
        }

        self.shared.commit(&before, task.clone(), agent.clone()).await?;

        info!(task_id = %id, from = %before.status, to = %to, "Task transitioned");
        self.shared.emit_task(&task);
        if let Some(agent) = &agent {
            self.shared.emit_agent(agent);
        }
        Ok(task)
    }

    /// Undo an assignment: the task goes back to `Queued` and the agent to
    /// `Online`.
    pub async fn unassign(&self, id: &TaskId) -> Result<Task> {
        self.transition(id, TaskStatus::Queued).await
    }

    /// Assign a queued task to an online agent.
    ///
    /// Both sides change together or not at all. Fails with
    /// `TaskNotQueued` when the task is not queued and `AgentUnavailable`
    /// when the agent is not online and idle at this moment.
    pub async fn assign(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        method: AssignmentMethod,
    ) -> Result<Task> {
        let _agent_guard = self.shared.locks.agent(agent_id).await;
        let _task_guard = self.shared.locks.task(task_id).await;

        let before = self.shared.load_task(task_id).await?;
        if before.status != TaskStatus::Queued {
            return Err(CodeflowError::TaskNotQueued {
                task: task_id.clone(),
                status: before.status,
            });
        }
        let mut agent = self.shared.load_agent(agent_id).await?;
        if !agent.is_available() {
            return Err(CodeflowError::AgentUnavailable(agent_id.clone()));
        }

        let now = Utc::now();
        let mut task = before.clone();
        task.status = TaskStatus::Assigned;
        task.assigned_agent_id = Some(agent_id.clone());
        task.assignment_method = Some(method);
        task.updated_at = now;

        agent.status = AgentStatus::Busy;
        agent.current_task_id = Some(task_id.clone());
        agent.updated_at = now;

        self.shared
            .commit(&before, task.clone(), Some(agent.clone()))
            .await?;

        info!(task_id = %task_id, agent_id = %agent_id, method = %method, "Task assigned");
        self.shared.emit_task(&task);
        self.shared.emit_agent(&agent);
        Ok(task)
    }

    pub async fn update_output(&self, id: &TaskId, output: impl Into<String>) -> Result<Task> {
        let _guard = self.shared.locks.task(id).await;
        let mut task = self.shared.load_task(id).await?;
        task.output = Some(output.into());
        task.updated_at = Utc::now();
        self.shared.stores.tasks.update(task.clone()).await?;
        self.shared.emit_task(&task);
        Ok(task)
    }

    pub async fn append_log(&self, id: &TaskId, entry: LogEntry) -> Result<()> {
        self.shared.load_task(id).await?;
        self.shared.logs.append(format!("task:{id}"), entry);
        Ok(())
    }

    pub async fn logs(&self, id: &TaskId) -> Result<Vec<LogEntry>> {
        self.shared.load_task(id).await?;
        Ok(self.shared.logs.entries(&format!("task:{id}")))
    }

    /// Delete a task that no agent holds. Unlinks it from its parent.
    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        let task = {
            let _guard = self.shared.locks.task(id).await;
            let task = self.shared.load_task(id).await?;
            if task.status.holds_agent() {
                return Err(CodeflowError::InvalidRequest(format!(
                    "task {id} is {} and cannot be deleted",
                    task.status
                )));
            }
            self.shared.stores.tasks.delete(id).await?;
            task
        };
        self.shared.logs.remove(&format!("task:{id}"));

        if let Some(parent_id) = &task.parent_task_id {
            let _guard = self.shared.locks.task(parent_id).await;
            if let Some(mut parent) = self.shared.stores.tasks.get(parent_id).await? {
                parent.subtasks.remove(id);
                parent.updated_at = Utc::now();
                self.shared.stores.tasks.update(parent).await?;
            }
        }
        debug!(task_id = %id, "Task deleted");
        Ok(())
    }

    async fn pending_dependencies(&self, task: &Task) -> Result<Vec<TaskId>> {
        let mut pending = Vec::new();
        for dep in &task.depends_on {
            let done = match self.shared.stores.tasks.get(dep).await? {
                Some(d) => d.status == TaskStatus::Completed,
                None => false,
            };
            if !done {
                pending.push(dep.clone());
            }
        }
        Ok(pending)
    }

    /// The agent record to write back when `task` stops holding it. `None`
    /// if the agent no longer points at this task.
    async fn release_agent(
        &self,
        agent_id: &AgentId,
        task: &TaskId,
    ) -> Result<Option<Agent>> {
        let Some(mut agent) = self.shared.stores.agents.get(agent_id).await? else {
            return Ok(None);
        };
        if agent.current_task_id.as_ref() != Some(task) {
            return Ok(None);
        }
        agent.current_task_id = None;
        if agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Online;
        }
        agent.updated_at = Utc::now();
        Ok(Some(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Outbound;
    use crate::registry::testing::registries;
    use crate::registry::Registries;
    use codeflow_core::event::EventBus;
    use codeflow_core::traits::Repository;
    use codeflow_core::types::{AgentSpec, LogLevel};
    use codeflow_store::{MemoryStore, Stores};
    use futures::future::BoxFuture;

    /// Task store whose updates always fail, and whose deletes fail too
    /// when `stuck`.
    struct BrokenUpdates {
        inner: MemoryStore<Task>,
        stuck: bool,
    }

    impl Repository<Task> for BrokenUpdates {
        fn create(&self, entity: Task) -> BoxFuture<'_, Result<()>> {
            self.inner.create(entity)
        }

        fn update(&self, _entity: Task) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(CodeflowError::Database("disk full".into())) })
        }

        fn get(&self, id: &TaskId) -> BoxFuture<'_, Result<Option<Task>>> {
            self.inner.get(id)
        }

        fn list(&self, filter: &TaskFilter) -> BoxFuture<'_, Result<Vec<Task>>> {
            self.inner.list(filter)
        }

        fn delete(&self, id: &TaskId) -> BoxFuture<'_, Result<bool>> {
            if self.stuck {
                Box::pin(async { Err(CodeflowError::Database("locked".into())) })
            } else {
                self.inner.delete(id)
            }
        }
    }

    async fn online_agent(regs: &crate::registry::Registries, name: &str) -> AgentId {
        let agent = regs.agents.register(AgentSpec::new(name)).await.unwrap();
        regs.agents.record_ping(&agent.id).await.unwrap();
        agent.id
    }

    #[tokio::test]
    async fn test_create_starts_queued_and_links_parent() {
        let (regs, _) = registries();
        let parent = regs.tasks.create(TaskSpec::new("epic")).await.unwrap();
        let child = regs
            .tasks
            .create(TaskSpec::new("story").with_parent(parent.id.clone()))
            .await
            .unwrap();
        assert_eq!(child.status, TaskStatus::Queued);

        let parent = regs.tasks.get(&parent.id).await.unwrap();
        assert!(parent.subtasks.contains(&child.id));

        regs.tasks.delete(&child.id).await.unwrap();
        let parent = regs.tasks.get(&parent.id).await.unwrap();
        assert!(parent.subtasks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_parent_link_rolls_back_subtask() {
        for stuck in [false, true] {
            let mut stores = Stores::memory();
            stores.tasks = Arc::new(BrokenUpdates {
                inner: MemoryStore::new(),
                stuck,
            });
            let bus = Arc::new(EventBus::new(16));
            let regs = Registries::new(stores.clone(), Outbound::local(bus), 5);

            let parent = regs.tasks.create(TaskSpec::new("epic")).await.unwrap();
            let err = regs
                .tasks
                .create(TaskSpec::new("story").with_parent(parent.id.clone()))
                .await
                .unwrap_err();
            // The link failure is reported even when the rollback fails too.
            assert!(matches!(err, CodeflowError::Database(ref m) if m == "disk full"));

            let left = stores.tasks.list(&TaskFilter::default()).await.unwrap();
            assert_eq!(left.len(), if stuck { 2 } else { 1 });
        }
    }

    #[tokio::test]
    async fn test_lifecycle_sets_timestamps_once_and_frees_agent() {
        let (regs, _) = registries();
        let agent = online_agent(&regs, "coder").await;
        let task = regs.tasks.create(TaskSpec::new("fix bug")).await.unwrap();

        regs.tasks
            .assign(&task.id, &agent, AssignmentMethod::Manual)
            .await
            .unwrap();
        let busy = regs.agents.get(&agent).await.unwrap();
        assert_eq!(busy.status, AgentStatus::Busy);
        assert_eq!(busy.current_task_id.as_ref(), Some(&task.id));

        let running = regs.tasks.transition(&task.id, TaskStatus::Running).await.unwrap();
        let started = running.started_at.unwrap();
        let done = regs
            .tasks
            .transition_with(
                &task.id,
                TaskStatus::Completed,
                TaskReport {
                    output: Some("patched".into()),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.started_at, Some(started));
        assert!(done.completed_at.is_some());
        assert_eq!(done.output.as_deref(), Some("patched"));

        let idle = regs.agents.get(&agent).await.unwrap();
        assert_eq!(idle.status, AgentStatus::Online);
        assert!(idle.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transitions_leave_state_untouched() {
        let (regs, _) = registries();
        let agent = online_agent(&regs, "coder").await;
        let task = regs.tasks.create(TaskSpec::new("t")).await.unwrap();

        let err = regs.tasks.transition(&task.id, TaskStatus::Running).await.unwrap_err();
        assert!(matches!(err, CodeflowError::IllegalTransition { .. }));
        let err = regs.tasks.transition(&task.id, TaskStatus::Assigned).await.unwrap_err();
        assert!(matches!(err, CodeflowError::AssignmentRequired(_)));

        regs.tasks.assign(&task.id, &agent, AssignmentMethod::Manual).await.unwrap();
        regs.tasks.transition(&task.id, TaskStatus::Running).await.unwrap();
        let done = regs.tasks.transition(&task.id, TaskStatus::Completed).await.unwrap();

        let err = regs
            .tasks
            .transition(&task.id, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CodeflowError::IllegalTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Completed,
                ..
            }
        ));
        let after = regs.tasks.get(&task.id).await.unwrap();
        assert_eq!(after.completed_at, done.completed_at);
        assert_eq!(after.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_running_requires_completed_dependencies() {
        let (regs, _) = registries();
        let a1 = online_agent(&regs, "a1").await;
        let a2 = online_agent(&regs, "a2").await;
        let first = regs.tasks.create(TaskSpec::new("first")).await.unwrap();
        let second = regs
            .tasks
            .create(TaskSpec::new("second").depends_on(first.id.clone()))
            .await
            .unwrap();

        regs.tasks.assign(&second.id, &a2, AssignmentMethod::Manual).await.unwrap();
        let err = regs
            .tasks
            .transition(&second.id, TaskStatus::Running)
            .await
            .unwrap_err();
        match err {
            CodeflowError::DependenciesIncomplete { pending, .. } => {
                assert_eq!(pending, vec![first.id.clone()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            regs.tasks.get(&second.id).await.unwrap().status,
            TaskStatus::Assigned
        );

        regs.tasks.assign(&first.id, &a1, AssignmentMethod::Manual).await.unwrap();
        regs.tasks.transition(&first.id, TaskStatus::Running).await.unwrap();
        regs.tasks.transition(&first.id, TaskStatus::Completed).await.unwrap();
        regs.tasks.transition(&second.id, TaskStatus::Running).await.unwrap();
    }

    #[tokio::test]
    async fn test_assign_checks_both_sides() {
        let (regs, _) = registries();
        let offline = regs.agents.register(AgentSpec::new("sleepy")).await.unwrap();
        let online = online_agent(&regs, "awake").await;
        let task = regs.tasks.create(TaskSpec::new("t")).await.unwrap();

        let err = regs
            .tasks
            .assign(&task.id, &offline.id, AssignmentMethod::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeflowError::AgentUnavailable(_)));
        assert!(err.is_transient());

        regs.tasks.assign(&task.id, &online, AssignmentMethod::Manual).await.unwrap();
        let other = online_agent(&regs, "other").await;
        let err = regs
            .tasks
            .assign(&task.id, &other, AssignmentMethod::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeflowError::TaskNotQueued { .. }));
        assert!(regs.agents.get(&other).await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_unassign_and_retry_clear_assignment() {
        let (regs, _) = registries();
        let agent = online_agent(&regs, "coder").await;
        let task = regs.tasks.create(TaskSpec::new("t")).await.unwrap();

        regs.tasks.assign(&task.id, &agent, AssignmentMethod::Manual).await.unwrap();
        let back = regs.tasks.unassign(&task.id).await.unwrap();
        assert_eq!(back.status, TaskStatus::Queued);
        assert!(back.assigned_agent_id.is_none());
        assert!(regs.agents.get(&agent).await.unwrap().is_available());

        regs.tasks.assign(&task.id, &agent, AssignmentMethod::Manual).await.unwrap();
        regs.tasks.transition(&task.id, TaskStatus::Running).await.unwrap();
        let failed = regs
            .tasks
            .transition_with(
                &task.id,
                TaskStatus::Failed,
                TaskReport {
                    output: None,
                    error: Some("tests failed".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("tests failed"));

        let requeued = regs.tasks.transition(&task.id, TaskStatus::Queued).await.unwrap();
        assert!(requeued.assigned_agent_id.is_none());
        assert_eq!(requeued.completed_at, failed.completed_at);
    }

    #[tokio::test]
    async fn test_concurrent_assign_same_agent() {
        let (regs, _) = registries();
        let agent = online_agent(&regs, "x").await;
        let t1 = regs.tasks.create(TaskSpec::new("t1")).await.unwrap();
        let t2 = regs.tasks.create(TaskSpec::new("t2")).await.unwrap();

        let (r1, r2) = tokio::join!(
            regs.tasks.assign(&t1.id, &agent, AssignmentMethod::Manual),
            regs.tasks.assign(&t2.id, &agent, AssignmentMethod::Manual),
        );
        let (winner, loser) = match (&r1, &r2) {
            (Ok(_), Err(e)) => (&t1.id, e),
            (Err(e), Ok(_)) => (&t2.id, e),
            _ => panic!("exactly one assignment must succeed: {r1:?} / {r2:?}"),
        };
        assert!(matches!(loser, CodeflowError::AgentUnavailable(_)));
        let agent = regs.agents.get(&agent).await.unwrap();
        assert_eq!(agent.current_task_id.as_ref(), Some(winner));
    }

    #[tokio::test]
    async fn test_delete_rejected_while_held() {
        let (regs, _) = registries();
        let agent = online_agent(&regs, "coder").await;
        let task = regs.tasks.create(TaskSpec::new("t")).await.unwrap();
        regs.tasks.assign(&task.id, &agent, AssignmentMethod::Manual).await.unwrap();
        assert!(regs.tasks.delete(&task.id).await.is_err());
    }

    #[tokio::test]
    async fn test_logs_and_grouping() {
        let (regs, _) = registries();
        let task = regs.tasks.create(TaskSpec::new("t")).await.unwrap();
        for i in 0..8 {
            regs.tasks
                .append_log(&task.id, LogEntry::new(LogLevel::Info, format!("step {i}")))
                .await
                .unwrap();
        }
        // Retention is 5 in the test registries.
        let logs = regs.tasks.logs(&task.id).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[4].message, "step 7");

        let groups = regs.tasks.by_status().await.unwrap();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups["queued"].len(), 1);
        assert!(groups["running"].is_empty());
    }
}
