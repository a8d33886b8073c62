//! Workflow run engine.
//!
//! A run is a set of tokens walking the workflow graph. A token that reaches
//! a `Task` node creates the task, tries to assign it and then waits in the
//! run's frontier; [`Engine::on_task_updated`] resumes it once the task
//! finishes. Each run is serialized by its own lock, so runs do not block
//! one another.
//!
//! Lock order is run, then agent, then task. Registry calls never take a run
//! lock, and callers release registry locks before feeding the engine.

mod state;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use codeflow_core::config::EngineConfig;
use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::event::{EventType, Notification};
use codeflow_core::graph::{evaluate, Node, NodeKind, TaskTemplate};
use codeflow_core::types::{
    Agent, AgentFilter, AgentId, AssignmentMethod, NodeId, RunContext, RunFilter, RunId, RunStatus, Task,
    TaskFilter, TaskId, TaskSpec, TaskStatus, WorkflowId, WorkflowRun, WorkflowStatus,
};
use codeflow_store::Stores;

use crate::assignment::{AssignmentPolicy, Candidate};
use crate::notifier::Outbound;
use crate::registry::{AgentRegistry, Registries, TaskRegistry, WorkflowRegistry};

use state::{Arrival, BranchScope, Failure, JoinAccumulator, RunState, Token};
pub use state::{FrontierEntry, FrontierSnapshot, PendingJoin};

/// Node visits allowed in one walk without reaching a task. Only a loop of
/// conditions with no task on it can exhaust this.
const MAX_WALK_STEPS: usize = 10_000;

enum Step {
    /// Token entering its node.
    Enter(Token),
    /// Token arriving at the join closing its innermost branch.
    Arrive(Token, Option<Failure>),
}

/// Outcome of one attempt to find an agent for a queued task.
#[derive(Debug, PartialEq)]
enum Dispatch {
    Assigned(AgentId),
    /// No available agent at all.
    NoCandidate,
    /// Left queued: manual without an agent, agent busy, or lost a race.
    Skipped,
}

/// Agents and their loads as one dispatch pass sees them.
struct Roster {
    agents: Vec<Agent>,
    loads: HashMap<AgentId, usize>,
}

impl Roster {
    fn load(&self, id: &AgentId) -> usize {
        self.loads.get(id).copied().unwrap_or(0)
    }

    fn assigned(&mut self, id: &AgentId) {
        *self.loads.entry(id.clone()).or_insert(0) += 1;
    }
}

/// Handle to the run engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    stores: Stores,
    registries: Registries,
    outbound: Outbound,
    config: EngineConfig,
    policy: AssignmentPolicy,
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunState>>>>,
}

impl Engine {
    pub fn new(stores: Stores, outbound: Outbound, config: EngineConfig) -> Self {
        let registries = Registries::new(stores.clone(), outbound.clone(), config.log_retention);
        Self {
            inner: Arc::new(Inner {
                stores,
                registries,
                outbound,
                config,
                policy: AssignmentPolicy::new(),
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.registries.agents
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.inner.registries.tasks
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.inner.registries.workflows
    }

    pub fn outbound(&self) -> &Outbound {
        &self.inner.outbound
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a run of an active, validated workflow.
    ///
    /// The graph is snapshotted, so later edits to the workflow do not
    /// affect this run. The walk proceeds until every token is waiting on a
    /// task or has reached an end.
    pub async fn submit_run(
        &self,
        workflow_id: &WorkflowId,
        context: RunContext,
    ) -> Result<WorkflowRun> {
        // Held until the run is stored, so a concurrent delete either sees
        // the run or removes the workflow before it is read.
        let guard = self.workflows().lock(workflow_id).await;
        let workflow = self.workflows().get(workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(CodeflowError::WorkflowNotActive {
                workflow: workflow_id.clone(),
                status: workflow.status,
            });
        }
        if !workflow.is_validated() {
            return Err(CodeflowError::GraphInvalid(workflow_id.clone()));
        }

        let graph = Arc::new(workflow.graph);
        let regions = graph.parallel_regions();
        let unpaired = graph
            .nodes()
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Parallel) && !regions.contains_key(&n.id));
        let start = graph.start().map(|n| n.id.clone());
        let Some(start) = start.filter(|_| !unpaired) else {
            error!(workflow_id = %workflow_id, "Validated graph failed to load");
            return Err(CodeflowError::GraphInvalid(workflow_id.clone()));
        };

        let run = WorkflowRun {
            id: RunId::new(),
            workflow_id: workflow_id.clone(),
            status: RunStatus::Pending,
            context,
            graph_version: workflow.graph_version,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            trace: Vec::new(),
        };
        self.inner.stores.runs.create(run.clone()).await?;
        drop(guard);

        let run_id = run.id.clone();
        let handle = Arc::new(Mutex::new(RunState::new(run, graph, regions)));
        self.inner
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.clone(), handle.clone());

        if let Err(e) = self.workflows().touch_last_run(workflow_id).await {
            warn!(workflow_id = %workflow_id, error = %e, "Failed to record last run time");
        }

        let mut state = handle.lock().await;
        state.run.status = RunStatus::Running;
        info!(run_id = %run_id, workflow_id = %workflow_id, "Run started");
        self.emit_run(&state.run, EventType::WorkflowStarted);

        let token = state.token(start, Vec::new(), BTreeSet::new());
        self.walk(&mut state, VecDeque::from([Step::Enter(token)])).await;
        self.settle(&mut state).await?;
        Ok(state.run.clone())
    }

    /// Resume a run after one of its tasks changed.
    ///
    /// Only `Completed` and `Failed` move the run. Events for tasks outside
    /// any run, for runs already terminal, or for tasks the run no longer
    /// waits on are accepted and ignored. A finished task freed its agent,
    /// so queued work is dispatched afterwards.
    pub async fn on_task_updated(&self, task_id: &TaskId) -> Result<()> {
        let task = self.tasks().get(task_id).await?;
        if let Some(run_id) = &task.run_id {
            match self.handle(run_id) {
                Some(handle) => self.resume(&handle, task_id).await?,
                None => debug!(run_id = %run_id, task_id = %task_id, "Task event for finished run"),
            }
        }
        if task.status.is_finished() {
            self.dispatch_pending().await?;
        }
        Ok(())
    }

    async fn resume(&self, handle: &Mutex<RunState>, task_id: &TaskId) -> Result<()> {
        let mut state = handle.lock().await;
        // Re-read under the run lock; the task may have moved on since.
        let task = self.tasks().get(task_id).await?;
        if state.run.status.is_terminal() {
            debug!(
                run_id = %state.run.id,
                task_id = %task_id,
                task_status = %task.status,
                "Run is terminal, late task event ignored"
            );
            return Ok(());
        }
        let Some(token_id) = state.token_for_task(task_id) else {
            return Ok(());
        };

        match task.status {
            TaskStatus::Completed => {
                let Some(mut token) = state.frontier.remove(&token_id) else {
                    return Ok(());
                };
                info!(
                    run_id = %state.run.id,
                    node_id = %token.node,
                    task_id = %task_id,
                    "Task node completed"
                );
                token.upstream = BTreeSet::from([task.id.clone()]);
                let mut queue = VecDeque::new();
                self.advance(&mut state, token, &mut queue);
                self.walk(&mut state, queue).await;
            }
            TaskStatus::Failed => self.task_failed(&mut state, token_id, &task).await,
            _ => return Ok(()),
        }
        self.settle(&mut state).await
    }

    /// Requeue a failed task while retries remain; otherwise the failure
    /// counts against its branch.
    async fn task_failed(&self, state: &mut RunState, token_id: u64, task: &Task) {
        let Some(token) = state.frontier.get_mut(&token_id) else {
            return;
        };
        let node_id = token.node.clone();
        let template = state
            .graph
            .node(&node_id)
            .and_then(Node::template)
            .cloned()
            .unwrap_or_default();
        let budget = template.max_retries.unwrap_or(self.inner.config.auto_retry);

        if token.attempts < budget {
            token.attempts += 1;
            info!(
                run_id = %state.run.id,
                node_id = %node_id,
                task_id = %task.id,
                attempt = token.attempts,
                budget,
                "Retrying failed task"
            );
            match self.tasks().transition(&task.id, TaskStatus::Queued).await {
                Ok(requeued) => self.try_dispatch(&requeued, template.agent_id.as_ref()).await,
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue task"),
            }
            return;
        }

        let Some(token) = state.frontier.remove(&token_id) else {
            return;
        };
        let reason = task
            .error_message
            .clone()
            .unwrap_or_else(|| "task failed".to_string());

        match token.scopes.last().map(|s| s.join.clone()) {
            None if task.optional => {
                warn!(
                    run_id = %state.run.id,
                    node_id = %node_id,
                    task_id = %task.id,
                    reason = %reason,
                    "Optional task failed, continuing"
                );
                let mut queue = VecDeque::new();
                self.advance(state, token, &mut queue);
                self.walk(state, queue).await;
            }
            None => {
                let message = format!("task {} at node {node_id} failed: {reason}", task.id);
                self.fail_run(state, message);
            }
            Some(join) => {
                warn!(
                    run_id = %state.run.id,
                    node_id = %node_id,
                    task_id = %task.id,
                    optional = task.optional,
                    join_id = %join,
                    "Branch failed, arriving at join"
                );
                let failure = Failure {
                    optional: task.optional,
                    parked: token.clone(),
                };
                let mut arriving = token;
                arriving.node = join;
                arriving.task = None;
                let queue = VecDeque::from([Step::Arrive(arriving, Some(failure))]);
                self.walk(state, queue).await;
            }
        }
    }

    /// Process queued steps until every token waits on a task or has ended.
    async fn walk(&self, state: &mut RunState, mut queue: VecDeque<Step>) {
        let mut steps = 0usize;
        while let Some(step) = queue.pop_front() {
            if state.run.status.is_terminal() {
                return;
            }
            steps += 1;
            if steps > MAX_WALK_STEPS {
                self.fail_run(
                    state,
                    format!("walk exceeded {MAX_WALK_STEPS} steps without reaching a task"),
                );
                return;
            }
            match step {
                Step::Enter(token) => {
                    let node = token.node.clone();
                    if let Err(e) = self.enter(state, token, &mut queue).await {
                        error!(run_id = %state.run.id, node_id = %node, error = %e, "Walk failed");
                        self.fail_run(state, format!("engine error at node {node}: {e}"));
                    }
                }
                Step::Arrive(token, failure) => self.arrive(state, token, failure, &mut queue),
            }
        }
    }

    async fn enter(
        &self,
        state: &mut RunState,
        mut token: Token,
        queue: &mut VecDeque<Step>,
    ) -> Result<()> {
        let graph = state.graph.clone();
        let Some(node) = graph.node(&token.node) else {
            self.defect(state, format!("token reached unknown node {}", token.node));
            return Ok(());
        };

        match &node.kind {
            NodeKind::Start => {
                state.run.trace.push(node.id.clone());
                self.advance(state, token, queue);
            }
            NodeKind::End => {
                state.run.trace.push(node.id.clone());
                debug!(run_id = %state.run.id, node_id = %node.id, "Token reached end");
            }
            NodeKind::Task { template } => {
                state.run.trace.push(node.id.clone());
                let task = self.instantiate(state, node, template, &token).await?;
                debug!(
                    run_id = %state.run.id,
                    node_id = %node.id,
                    task_id = %task.id,
                    "Task node dispatched"
                );
                token.task = Some(task.id.clone());
                token.attempts = 0;
                state.frontier.insert(token.id, token);
                self.try_dispatch(&task, template.agent_id.as_ref()).await;
            }
            NodeKind::Condition { expr } => {
                state.run.trace.push(node.id.clone());
                match evaluate(expr, &state.run.context) {
                    Ok(taken) => {
                        let edge = if taken { 0 } else { 1 };
                        let Some(next) = node.outgoing.get(edge) else {
                            self.defect(state, format!("condition {} lacks edge {edge}", node.id));
                            return Ok(());
                        };
                        debug!(
                            run_id = %state.run.id,
                            node_id = %node.id,
                            result = taken,
                            next = %next,
                            "Condition evaluated"
                        );
                        token.node = next.clone();
                        queue.push_back(Step::Enter(token));
                    }
                    Err(message) => {
                        let err = CodeflowError::ConditionEval {
                            node: node.id.to_string(),
                            message,
                        };
                        self.fail_run(state, err.to_string());
                    }
                }
            }
            NodeKind::Parallel => {
                state.run.trace.push(node.id.clone());
                let Some(join) = state.regions.get(&node.id).cloned() else {
                    self.defect(state, format!("parallel {} has no join", node.id));
                    return Ok(());
                };
                for head in &node.outgoing {
                    let mut scopes = token.scopes.clone();
                    scopes.push(BranchScope {
                        parallel: node.id.clone(),
                        join: join.clone(),
                        branch: head.clone(),
                    });
                    let branch = state.token(head.clone(), scopes, token.upstream.clone());
                    queue.push_back(Step::Enter(branch));
                }
            }
            NodeKind::Join => self.arrive(state, token, None, queue),
        }
        Ok(())
    }

    /// Record a branch at its join and fire the join once every branch is
    /// in. A mandatory failed branch fails the run when the join fires.
    fn arrive(
        &self,
        state: &mut RunState,
        mut token: Token,
        failure: Option<Failure>,
        queue: &mut VecDeque<Step>,
    ) {
        let join = token.node.clone();
        let Some(scope) = token.scopes.pop().filter(|s| s.join == join) else {
            self.defect(state, format!("join {join} reached outside its parallel region"));
            return;
        };

        let acc = state
            .joins
            .entry(join.clone())
            .or_insert_with(|| JoinAccumulator {
                outer: token.scopes.clone(),
                ..Default::default()
            });
        acc.arrivals.insert(
            scope.branch.clone(),
            Arrival {
                upstream: token.upstream,
                failure,
            },
        );
        let arrived = acc.arrived();
        debug!(
            run_id = %state.run.id,
            join_id = %join,
            parallel_id = %scope.parallel,
            branch = %scope.branch,
            arrived = arrived.len(),
            "Branch arrived at join"
        );
        let expected = state.graph.next_nodes(&scope.parallel);
        if !expected.iter().all(|b| arrived.contains(b)) {
            return;
        }
        let Some(acc) = state.joins.remove(&join) else {
            return;
        };

        let failed: Vec<String> = acc
            .arrivals
            .iter()
            .filter_map(|(branch, a)| {
                let f = a.failure.as_ref().filter(|f| !f.optional)?;
                let task = f.parked.task.as_ref().map(|t| t.to_string()).unwrap_or_default();
                Some(format!("{branch} (task {task} at {})", f.parked.node))
            })
            .collect();
        if !failed.is_empty() {
            let message = format!(
                "mandatory branch failed before join {join}: {}",
                failed.join(", ")
            );
            self.fail_run(state, message);
            return;
        }

        let upstream = acc
            .arrivals
            .into_values()
            .flat_map(|a| a.upstream)
            .collect();
        info!(run_id = %state.run.id, join_id = %join, "Join fired");
        state.run.trace.push(join.clone());
        let joined = state.token(join, acc.outer, upstream);
        self.advance(state, joined, queue);
    }

    /// Move a token to the single successor of its node.
    fn advance(&self, state: &mut RunState, mut token: Token, queue: &mut VecDeque<Step>) {
        let Some(next) = state.graph.next_nodes(&token.node).first().cloned() else {
            self.defect(state, format!("node {} has no successor", token.node));
            return;
        };
        token.node = next;
        token.task = None;
        token.attempts = 0;
        queue.push_back(Step::Enter(token));
    }

    async fn instantiate(
        &self,
        state: &RunState,
        node: &Node,
        template: &TaskTemplate,
        token: &Token,
    ) -> Result<Task> {
        let title = template.title.clone().unwrap_or_else(|| {
            if node.label.is_empty() {
                node.id.to_string()
            } else {
                node.label.clone()
            }
        });
        let spec = TaskSpec {
            title,
            description: template.description.clone(),
            priority: template.priority,
            parent_task_id: None,
            depends_on: token.upstream.clone(),
            required_capabilities: template.required_capabilities.clone(),
            optional: template.optional,
            files: template.files.clone(),
            workflow_id: Some(state.run.workflow_id.clone()),
            run_id: Some(state.run.id.clone()),
            node_id: Some(node.id.clone()),
        };
        let method = template
            .assignment
            .unwrap_or(self.inner.config.default_assignment);
        self.tasks().create_with_method(spec, Some(method)).await
    }

    /// Assignment trouble never fails a run; the task stays queued for
    /// [`dispatch_pending`](Self::dispatch_pending).
    async fn try_dispatch(&self, task: &Task, preferred: Option<&AgentId>) {
        if let Err(e) = self.dispatch(task, preferred, &mut None).await {
            warn!(task_id = %task.id, error = %e, "Assignment failed, task stays queued");
        }
    }

    async fn roster(&self) -> Result<Roster> {
        Ok(Roster {
            agents: self.agents().list(&AgentFilter::default()).await?,
            loads: self.agents().loads().await?,
        })
    }

    /// `roster` is read on first need and then kept current, so a pass over
    /// many queued tasks lists agents and loads once.
    async fn dispatch(
        &self,
        task: &Task,
        preferred: Option<&AgentId>,
        roster: &mut Option<Roster>,
    ) -> Result<Dispatch> {
        let method = task
            .assignment_method
            .unwrap_or(self.inner.config.default_assignment);

        if method == AssignmentMethod::Manual {
            let Some(agent_id) = preferred else {
                debug!(task_id = %task.id, "Manual task waits for an explicit assignment");
                return Ok(Dispatch::Skipped);
            };
            return match self.tasks().assign(&task.id, agent_id, method).await {
                Ok(_) => {
                    if let Some(roster) = roster.as_mut() {
                        roster.assigned(agent_id);
                        self.refresh(roster, agent_id).await;
                    }
                    Ok(Dispatch::Assigned(agent_id.clone()))
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        error = %e,
                        "Manual assignment deferred"
                    );
                    Ok(Dispatch::Skipped)
                }
                Err(e) => Err(e),
            };
        }

        let roster = match roster {
            Some(current) => current,
            None => roster.insert(self.roster().await?),
        };
        // Losing an agent to a concurrent assignment moves on to the next
        // candidate.
        let mut excluded: HashSet<AgentId> = HashSet::new();
        loop {
            let candidates: Vec<Candidate<'_>> = roster
                .agents
                .iter()
                .filter(|a| !excluded.contains(&a.id))
                .map(|a| Candidate::new(a, roster.load(&a.id)))
                .collect();

            let pick = self
                .inner
                .policy
                .select(&candidates, &task.required_capabilities, method);
            let Some(pick) = pick else {
                debug!(
                    task_id = %task.id,
                    method = %method,
                    "No agent available, task stays queued"
                );
                return Ok(Dispatch::NoCandidate);
            };

            match self.tasks().assign(&task.id, &pick, method).await {
                Ok(_) => {
                    self.inner.policy.commit(method, &pick);
                    roster.assigned(&pick);
                    self.refresh(roster, &pick).await;
                    return Ok(Dispatch::Assigned(pick));
                }
                Err(CodeflowError::AgentUnavailable(_)) => {
                    debug!(
                        task_id = %task.id,
                        agent_id = %pick,
                        "Agent taken, trying next candidate"
                    );
                    self.refresh(roster, &pick).await;
                    excluded.insert(pick);
                }
                Err(CodeflowError::TaskNotQueued { .. }) => return Ok(Dispatch::Skipped),
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-read one agent after its availability changed.
    async fn refresh(&self, roster: &mut Roster, id: &AgentId) {
        match self.agents().get(id).await {
            Ok(agent) => {
                if let Some(slot) = roster.agents.iter_mut().find(|a| a.id == *id) {
                    *slot = agent;
                }
            }
            Err(_) => roster.agents.retain(|a| a.id != *id),
        }
    }

    /// Try to assign every queued task of a live run, most urgent first.
    /// Returns how many were assigned.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let mut queued = self
            .tasks()
            .list(&TaskFilter {
                status: Some(TaskStatus::Queued),
                ..Default::default()
            })
            .await?;
        queued.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut assigned = 0;
        let mut roster = None;
        for task in queued {
            let Some(handle) = task.run_id.as_ref().and_then(|r| self.handle(r)) else {
                continue;
            };
            let preferred = {
                let state = handle.lock().await;
                if state.run.status.is_terminal() {
                    continue;
                }
                task.node_id
                    .as_ref()
                    .and_then(|n| state.graph.node(n))
                    .and_then(Node::template)
                    .and_then(|t| t.agent_id.clone())
            };
            match self.dispatch(&task, preferred.as_ref(), &mut roster).await? {
                Dispatch::Assigned(_) => assigned += 1,
                Dispatch::NoCandidate => break,
                Dispatch::Skipped => {}
            }
        }
        if assigned > 0 {
            debug!(assigned, "Dispatched pending tasks");
        }
        Ok(assigned)
    }

    /// Assign a task to a named agent.
    pub async fn assign_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<Task> {
        self.tasks()
            .assign(task_id, agent_id, AssignmentMethod::Manual)
            .await
    }

    /// Resubmit a failed task node of a running run.
    ///
    /// Only a failure inside a parallel branch whose join has not fired yet
    /// can be retried: a top-level mandatory failure has already failed the
    /// run.
    pub async fn retry_task(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.tasks().get(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(CodeflowError::IllegalTransition {
                task: task_id.clone(),
                from: task.status,
                to: TaskStatus::Queued,
            });
        }
        let Some(run_id) = task.run_id.clone() else {
            return Err(CodeflowError::InvalidRequest(format!(
                "task {task_id} is not part of a run"
            )));
        };
        let Some(handle) = self.handle(&run_id) else {
            return Err(self.gone(&run_id).await);
        };

        let mut state = handle.lock().await;
        if state.run.status.is_terminal() {
            return Err(CodeflowError::RunTerminal {
                run: run_id,
                status: state.run.status,
            });
        }
        if !state.is_parked(task_id) {
            return Err(CodeflowError::InvalidRequest(format!(
                "task {task_id} is not awaited by run {run_id}"
            )));
        }

        let requeued = self.tasks().transition(task_id, TaskStatus::Queued).await?;
        let Some(mut token) = state.unpark(task_id) else {
            return Ok(requeued);
        };
        token.attempts = 0;
        let preferred = state
            .graph
            .node(&token.node)
            .and_then(Node::template)
            .and_then(|t| t.agent_id.clone());
        info!(run_id = %run_id, node_id = %token.node, task_id = %task_id, "Task resubmitted");
        state.frontier.insert(token.id, token);
        self.try_dispatch(&requeued, preferred.as_ref()).await;
        self.settle(&mut state).await?;
        drop(state);
        self.tasks().get(task_id).await
    }

    /// Stop advancing a run. Tasks already handed out are left alone.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let Some(handle) = self.handle(run_id) else {
            return Err(self.gone(run_id).await);
        };
        let mut state = handle.lock().await;
        if state.run.status.is_terminal() {
            return Err(CodeflowError::RunTerminal {
                run: run_id.clone(),
                status: state.run.status,
            });
        }
        state.run.status = RunStatus::Cancelled;
        state.run.finished_at = Some(Utc::now());
        info!(run_id = %run_id, open = state.frontier.len(), "Run cancelled");
        self.emit_run(&state.run, EventType::WorkflowCancelled);
        self.inner.stores.runs.update(state.run.clone()).await?;
        self.evict(run_id);
        Ok(state.run.clone())
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.lock().await.run.clone());
        }
        self.inner
            .stores
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| CodeflowError::not_found("run", run_id))
    }

    pub async fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<WorkflowRun>> {
        self.inner
            .stores
            .runs
            .list(&RunFilter {
                workflow_id: workflow_id.cloned(),
                status: None,
            })
            .await
    }

    /// A finished run has nothing in flight, so its snapshot is empty.
    pub async fn frontier(&self, run_id: &RunId) -> Result<FrontierSnapshot> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.lock().await.snapshot());
        }
        let run = self.get_run(run_id).await?;
        Ok(FrontierSnapshot {
            run_id: run.id,
            status: run.status,
            active: Vec::new(),
            joins: Vec::new(),
        })
    }

    /// Nodes visited so far, in visit order. Joins appear once, when they
    /// fire.
    pub async fn trace(&self, run_id: &RunId) -> Result<Vec<NodeId>> {
        Ok(self.get_run(run_id).await?.trace)
    }

    fn handle(&self, run_id: &RunId) -> Option<Arc<Mutex<RunState>>> {
        self.inner
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
    }

    /// Drop a finished run's in-memory state. The stored run keeps its
    /// status and trace.
    fn evict(&self, run_id: &RunId) {
        let removed = self
            .inner
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
        if removed.is_some() {
            debug!(run_id = %run_id, "Run state released");
        }
    }

    /// Error for a run with no in-memory state: terminal if stored as such,
    /// otherwise not found.
    async fn gone(&self, run_id: &RunId) -> CodeflowError {
        match self.inner.stores.runs.get(run_id).await {
            Ok(Some(run)) if run.status.is_terminal() => CodeflowError::RunTerminal {
                run: run_id.clone(),
                status: run.status,
            },
            Ok(_) => CodeflowError::not_found("run", run_id),
            Err(e) => e,
        }
    }

    /// Complete a live run whose frontier drained, then persist it. A
    /// terminal run is evicted once stored.
    async fn settle(&self, state: &mut RunState) -> Result<()> {
        if !state.run.status.is_terminal() && state.frontier.is_empty() {
            if state.joins.is_empty() {
                state.run.status = RunStatus::Completed;
                state.run.finished_at = Some(Utc::now());
                info!(run_id = %state.run.id, "Run completed");
                self.emit_run(&state.run, EventType::WorkflowCompleted);
            } else {
                let waiting: Vec<String> = state.joins.keys().map(|j| j.to_string()).collect();
                self.defect(
                    state,
                    format!("frontier drained with joins still waiting: {}", waiting.join(", ")),
                );
            }
        }
        self.inner.stores.runs.update(state.run.clone()).await?;
        if state.run.status.is_terminal() {
            self.evict(&state.run.id);
        }
        Ok(())
    }

    fn fail_run(&self, state: &mut RunState, reason: String) {
        if state.run.status.is_terminal() {
            return;
        }
        warn!(run_id = %state.run.id, reason = %reason, "Run failed");
        state.run.status = RunStatus::Failed;
        state.run.error = Some(reason);
        state.run.finished_at = Some(Utc::now());
        self.emit_run(&state.run, EventType::WorkflowFailed);
    }

    /// A validated graph misbehaving at run time.
    fn defect(&self, state: &mut RunState, message: String) {
        error!(run_id = %state.run.id, "{message}");
        self.fail_run(state, message);
    }

    fn emit_run(&self, run: &WorkflowRun, event_type: EventType) {
        let payload = serde_json::json!({
            "workflow_id": run.workflow_id,
            "error": run.error,
        });
        self.inner
            .outbound
            .emit(Notification::new(event_type, &run.id, run.status).with_payload(payload));
    }
}
