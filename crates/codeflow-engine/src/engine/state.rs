use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use codeflow_core::graph::WorkflowGraph;
use codeflow_core::types::{NodeId, RunId, RunStatus, TaskId, WorkflowRun};

/// One open branch of a `Parallel` node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BranchScope {
    pub parallel: NodeId,
    pub join: NodeId,
    /// Head node of the branch, i.e. the parallel's successor it started at.
    pub branch: NodeId,
}

/// A position in the graph. Tokens waiting on a task make up the frontier.
#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub id: u64,
    pub node: NodeId,
    /// Enclosing parallel branches, innermost last.
    pub scopes: Vec<BranchScope>,
    /// Completed tasks immediately upstream; the next task depends on them.
    pub upstream: BTreeSet<TaskId>,
    pub task: Option<TaskId>,
    /// Auto-retries already spent on `task`.
    pub attempts: u32,
}

/// A failed task whose branch gave up and went to its join.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub optional: bool,
    /// The token as it was at the task node, so the task can be retried.
    pub parked: Token,
}

#[derive(Debug, Clone)]
pub(crate) struct Arrival {
    pub upstream: BTreeSet<TaskId>,
    pub failure: Option<Failure>,
}

/// Branches that reached one join so far.
#[derive(Debug, Clone, Default)]
pub(crate) struct JoinAccumulator {
    pub arrivals: BTreeMap<NodeId, Arrival>,
    /// Scopes enclosing the parallel region; the joined token resumes with
    /// these.
    pub outer: Vec<BranchScope>,
}

impl JoinAccumulator {
    pub fn arrived(&self) -> BTreeSet<NodeId> {
        self.arrivals.keys().cloned().collect()
    }
}

/// Everything the engine knows about one run.
pub(crate) struct RunState {
    pub run: WorkflowRun,
    /// Snapshot of the graph at submission. Later edits do not affect it.
    pub graph: Arc<WorkflowGraph>,
    pub regions: BTreeMap<NodeId, NodeId>,
    pub frontier: BTreeMap<u64, Token>,
    pub joins: BTreeMap<NodeId, JoinAccumulator>,
    next_token: u64,
}

impl RunState {
    pub fn new(
        run: WorkflowRun,
        graph: Arc<WorkflowGraph>,
        regions: BTreeMap<NodeId, NodeId>,
    ) -> Self {
        Self {
            run,
            graph,
            regions,
            frontier: BTreeMap::new(),
            joins: BTreeMap::new(),
            next_token: 0,
        }
    }

    pub fn token(
        &mut self,
        node: NodeId,
        scopes: Vec<BranchScope>,
        upstream: BTreeSet<TaskId>,
    ) -> Token {
        self.next_token += 1;
        Token {
            id: self.next_token,
            node,
            scopes,
            upstream,
            task: None,
            attempts: 0,
        }
    }

    pub fn token_for_task(&self, task: &TaskId) -> Option<u64> {
        self.frontier
            .values()
            .find(|t| t.task.as_ref() == Some(task))
            .map(|t| t.id)
    }

    /// The join and branch holding the failed arrival of `task`.
    fn find_parked(&self, task: &TaskId) -> Option<(NodeId, NodeId)> {
        self.joins.iter().find_map(|(join, acc)| {
            acc.arrivals.iter().find_map(|(branch, arrival)| {
                let parked = &arrival.failure.as_ref()?.parked;
                (parked.task.as_ref() == Some(task)).then(|| (join.clone(), branch.clone()))
            })
        })
    }

    pub fn is_parked(&self, task: &TaskId) -> bool {
        self.find_parked(task).is_some()
    }

    /// Take the failed arrival of `task` back out of its join.
    pub fn unpark(&mut self, task: &TaskId) -> Option<Token> {
        let (join, branch) = self.find_parked(task)?;
        let acc = self.joins.get_mut(&join)?;
        let arrival = acc.arrivals.remove(&branch)?;
        if acc.arrivals.is_empty() {
            self.joins.remove(&join);
        }
        arrival.failure.map(|f| f.parked)
    }

    pub fn snapshot(&self) -> FrontierSnapshot {
        let active = self
            .frontier
            .values()
            .map(|t| FrontierEntry {
                node_id: t.node.clone(),
                task_id: t.task.clone(),
                branch: t.scopes.last().map(|s| s.branch.clone()),
                attempts: t.attempts,
            })
            .collect();

        let joins = self
            .joins
            .iter()
            .map(|(join, acc)| {
                let expected = self
                    .regions
                    .iter()
                    .find(|(_, j)| *j == join)
                    .map(|(p, _)| self.graph.next_nodes(p).to_vec())
                    .unwrap_or_default();
                PendingJoin {
                    join_id: join.clone(),
                    arrived: acc.arrived().into_iter().collect(),
                    failed: acc
                        .arrivals
                        .iter()
                        .filter(|(_, a)| a.failure.is_some())
                        .map(|(b, _)| b.clone())
                        .collect(),
                    expected,
                }
            })
            .collect();

        FrontierSnapshot {
            run_id: self.run.id.clone(),
            status: self.run.status,
            active,
            joins,
        }
    }
}

/// Point-in-time view of a run's frontier.
#[derive(Debug, Clone, Serialize)]
pub struct FrontierSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub active: Vec<FrontierEntry>,
    pub joins: Vec<PendingJoin>,
}

/// A frontier node waiting on its task.
#[derive(Debug, Clone, Serialize)]
pub struct FrontierEntry {
    pub node_id: NodeId,
    pub task_id: Option<TaskId>,
    /// Head of the innermost parallel branch this entry runs in.
    pub branch: Option<NodeId>,
    pub attempts: u32,
}

/// A join that has seen some, but not all, of its branches.
#[derive(Debug, Clone, Serialize)]
pub struct PendingJoin {
    pub join_id: NodeId,
    pub arrived: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub expected: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codeflow_core::graph::{Node, TaskTemplate};
    use codeflow_core::types::WorkflowId;

    fn state() -> RunState {
        let graph = WorkflowGraph::new(vec![
            Node::start("s").to("fork"),
            Node::parallel("fork").to("b").to("c"),
            Node::task("b", TaskTemplate::default()).to("join"),
            Node::task("c", TaskTemplate::default()).to("join"),
            Node::join("join").to("e"),
            Node::end("e"),
        ]);
        let regions = graph.parallel_regions();
        let run = WorkflowRun {
            id: RunId::from("r1"),
            workflow_id: WorkflowId::from("w1"),
            status: RunStatus::Running,
            context: Default::default(),
            graph_version: 1,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            trace: Vec::new(),
        };
        RunState::new(run, Arc::new(graph), regions)
    }

    fn scope(branch: &str) -> Vec<BranchScope> {
        vec![BranchScope {
            parallel: NodeId::from("fork"),
            join: NodeId::from("join"),
            branch: NodeId::from(branch),
        }]
    }

    #[test]
    fn test_tokens_get_fresh_ids() {
        let mut state = state();
        let a = state.token(NodeId::from("b"), scope("b"), BTreeSet::new());
        let b = state.token(NodeId::from("c"), scope("c"), BTreeSet::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_unpark_restores_failed_branch() {
        let mut state = state();
        let mut parked = state.token(NodeId::from("b"), scope("b"), BTreeSet::new());
        parked.task = Some(TaskId::from("t-b"));

        let mut acc = JoinAccumulator::default();
        acc.arrivals.insert(
            NodeId::from("b"),
            Arrival {
                upstream: BTreeSet::new(),
                failure: Some(Failure {
                    optional: false,
                    parked: parked.clone(),
                }),
            },
        );
        state.joins.insert(NodeId::from("join"), acc);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.joins.len(), 1);
        assert_eq!(snapshot.joins[0].failed, vec![NodeId::from("b")]);
        assert_eq!(
            snapshot.joins[0].expected,
            vec![NodeId::from("b"), NodeId::from("c")]
        );

        assert!(state.is_parked(&TaskId::from("t-b")));
        assert!(!state.is_parked(&TaskId::from("t-c")));
        let token = state.unpark(&TaskId::from("t-b")).unwrap();
        assert_eq!(token.id, parked.id);
        assert_eq!(token.scopes, scope("b"));
        // The emptied accumulator is dropped.
        assert!(state.joins.is_empty());
    }

    #[test]
    fn test_snapshot_lists_waiting_tasks() {
        let mut state = state();
        let mut token = state.token(NodeId::from("c"), scope("c"), BTreeSet::new());
        token.task = Some(TaskId::from("t-c"));
        state.frontier.insert(token.id, token.clone());

        assert_eq!(state.token_for_task(&TaskId::from("t-c")), Some(token.id));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, RunStatus::Running);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.active[0].branch, Some(NodeId::from("c")));
        assert_eq!(snapshot.active[0].task_id, Some(TaskId::from("t-c")));
    }
}
