use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{condition, Node, NodeKind, WorkflowGraph};
use crate::types::NodeId;

/// Nested parallel regions deeper than this are rejected.
const MAX_REGION_DEPTH: usize = 32;

/// One structural defect in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum StructuralError {
    #[error("graph has no start node")]
    NoStartNode,

    #[error("graph has several start nodes: {}", join_nodes(.0))]
    MultipleStartNodes(Vec<NodeId>),

    #[error("start node {0} is the target of an edge")]
    StartHasIncoming(NodeId),

    #[error("start node {0} has no outgoing edge")]
    StartHasNoOutgoing(NodeId),

    #[error("graph has no end node")]
    NoEndNode,

    #[error("end node {0} has outgoing edges")]
    EndHasOutgoing(NodeId),

    #[error("node id {0} is used more than once")]
    DuplicateNode(NodeId),

    #[error("edge {from} -> {to} points at a node that does not exist")]
    DanglingEdge { from: NodeId, to: NodeId },

    #[error("node {0} is unreachable from the start node")]
    UnreachableNode(NodeId),

    #[error("parallel node {parallel} is not closed by a matching join: {reason}")]
    ParallelJoinMismatch { parallel: NodeId, reason: String },

    #[error("join node {0} does not close any parallel node")]
    UnmatchedJoin(NodeId),

    #[error("condition node {node} needs exactly two outgoing edges, found {found}")]
    ConditionArity { node: NodeId, found: usize },

    #[error("condition node {node} has an unparseable expression: {message}")]
    InvalidCondition { node: NodeId, message: String },

    #[error("{kind} node {node} has {found} successors; only parallel and condition nodes branch")]
    AmbiguousSuccessor {
        node: NodeId,
        kind: String,
        found: usize,
    },

    #[error("{kind} node {node} has no outgoing edge")]
    DeadEnd { node: NodeId, kind: String },
}

fn join_nodes(ids: &[NodeId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

/// Outcome of validating a graph. Empty `errors` means the graph is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<StructuralError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert into a `Result`, carrying every violation on failure.
    pub fn into_result(self) -> crate::error::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(crate::error::CodeflowError::Structural(self.errors))
        }
    }
}

pub(crate) fn validate(graph: &WorkflowGraph) -> ValidationResult {
    let mut errors = Vec::new();

    check_duplicates(graph, &mut errors);
    check_endpoints(graph, &mut errors);
    check_edges(graph, &mut errors);
    check_out_degree(graph, &mut errors);
    check_reachability(graph, &mut errors);
    check_regions(graph, &mut errors);

    ValidationResult { errors }
}

fn check_duplicates(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for node in graph.nodes() {
        if !seen.insert(&node.id) && reported.insert(&node.id) {
            errors.push(StructuralError::DuplicateNode(node.id.clone()));
        }
    }
}

fn check_endpoints(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    let starts: Vec<&Node> = graph
        .nodes()
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .collect();

    match starts.len() {
        0 => errors.push(StructuralError::NoStartNode),
        1 => {}
        _ => errors.push(StructuralError::MultipleStartNodes(
            starts.iter().map(|n| n.id.clone()).collect(),
        )),
    }

    for start in &starts {
        if !graph.predecessors(&start.id).is_empty() {
            errors.push(StructuralError::StartHasIncoming(start.id.clone()));
        }
        if start.outgoing.is_empty() {
            errors.push(StructuralError::StartHasNoOutgoing(start.id.clone()));
        }
    }

    let ends: Vec<&Node> = graph
        .nodes()
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::End))
        .collect();
    if ends.is_empty() {
        errors.push(StructuralError::NoEndNode);
    }
    for end in ends {
        if !end.outgoing.is_empty() {
            errors.push(StructuralError::EndHasOutgoing(end.id.clone()));
        }
    }
}

fn check_edges(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    for node in graph.nodes() {
        for target in &node.outgoing {
            if !graph.contains(target) {
                errors.push(StructuralError::DanglingEdge {
                    from: node.id.clone(),
                    to: target.clone(),
                });
            }
        }
    }
}

fn check_out_degree(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    for node in graph.nodes() {
        let found = node.outgoing.len();
        match &node.kind {
            // Covered by the endpoint checks.
            NodeKind::Start if found == 0 => {}
            NodeKind::End => {}
            NodeKind::Condition { expr } => {
                if found != 2 {
                    errors.push(StructuralError::ConditionArity {
                        node: node.id.clone(),
                        found,
                    });
                }
                if let Err(message) = condition::parse(expr) {
                    errors.push(StructuralError::InvalidCondition {
                        node: node.id.clone(),
                        message,
                    });
                }
            }
            NodeKind::Parallel if found == 0 => errors.push(StructuralError::DeadEnd {
                node: node.id.clone(),
                kind: node.kind.name().to_string(),
            }),
            NodeKind::Parallel => {}
            NodeKind::Start | NodeKind::Task { .. } | NodeKind::Join => {
                if found == 0 {
                    errors.push(StructuralError::DeadEnd {
                        node: node.id.clone(),
                        kind: node.kind.name().to_string(),
                    });
                } else if found > 1 {
                    errors.push(StructuralError::AmbiguousSuccessor {
                        node: node.id.clone(),
                        kind: node.kind.name().to_string(),
                        found,
                    });
                }
            }
        }
    }
}

fn check_reachability(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    // Reachability is only meaningful from a unique start.
    let Some(start) = graph.start() else {
        return;
    };

    let mut reached: HashSet<&NodeId> = HashSet::new();
    let mut queue = VecDeque::from([&start.id]);
    reached.insert(&start.id);
    while let Some(id) = queue.pop_front() {
        for next in graph.next_nodes(id) {
            if graph.contains(next) && reached.insert(next) {
                queue.push_back(next);
            }
        }
    }

    let mut reported = HashSet::new();
    for node in graph.nodes() {
        if !reached.contains(&node.id) && reported.insert(&node.id) {
            errors.push(StructuralError::UnreachableNode(node.id.clone()));
        }
    }
}

fn check_regions(graph: &WorkflowGraph, errors: &mut Vec<StructuralError>) {
    let mut tracer = RegionTracer::new(graph);
    let mut closed_by: BTreeMap<NodeId, NodeId> = BTreeMap::new();

    for node in graph.nodes() {
        if !matches!(node.kind, NodeKind::Parallel) || node.outgoing.is_empty() {
            continue;
        }
        let join = match tracer.region_join(node) {
            Ok(join) => join,
            Err(reason) => {
                errors.push(StructuralError::ParallelJoinMismatch {
                    parallel: node.id.clone(),
                    reason,
                });
                continue;
            }
        };

        if let Some(other) = closed_by.get(&join) {
            errors.push(StructuralError::ParallelJoinMismatch {
                parallel: node.id.clone(),
                reason: format!("join {join} already closes parallel {other}"),
            });
            continue;
        }

        // Every edge into the join must come from inside the region, or the
        // join could fire for arrivals that were never forked.
        let members = tracer.members_of(&node.id);
        let outsiders: Vec<&NodeId> = graph
            .predecessors(&join)
            .into_iter()
            .filter(|p| **p != node.id && !members.contains(*p))
            .collect();
        if let Some(outsider) = outsiders.first() {
            errors.push(StructuralError::ParallelJoinMismatch {
                parallel: node.id.clone(),
                reason: format!("join {join} also receives an edge from {outsider} outside the region"),
            });
            continue;
        }

        closed_by.insert(join, node.id.clone());
    }

    for node in graph.nodes() {
        if matches!(node.kind, NodeKind::Join) && !tracer.touched_joins.contains(&node.id) {
            errors.push(StructuralError::UnmatchedJoin(node.id.clone()));
        }
    }
}

/// Walks parallel branches forward to find the join each one closes at.
///
/// A branch is followed through tasks, nested parallel regions (skipping to
/// the nested join) and conditions (every arm must close at the same join;
/// arms that loop back onto the current path are ignored). Each node is
/// walked at most once per region, so condition chains stay linear.
pub(crate) struct RegionTracer<'g> {
    graph: &'g WorkflowGraph,
    /// Region members per parallel node, filled as regions are traced.
    members: HashMap<NodeId, BTreeSet<NodeId>>,
    /// Joins reached by any branch, matched or not.
    touched_joins: HashSet<NodeId>,
}

impl<'g> RegionTracer<'g> {
    pub(crate) fn new(graph: &'g WorkflowGraph) -> Self {
        Self {
            graph,
            members: HashMap::new(),
            touched_joins: HashSet::new(),
        }
    }

    fn members_of(&self, parallel: &NodeId) -> BTreeSet<NodeId> {
        self.members.get(parallel).cloned().unwrap_or_default()
    }

    /// The join closing `parallel`, or the reason there is none.
    pub(crate) fn region_join(&mut self, parallel: &Node) -> Result<NodeId, String> {
        let mut path = vec![parallel.id.clone()];
        let mut members = BTreeSet::new();
        self.trace_region(parallel, &mut path, &mut members, 0)
    }

    fn trace_region(
        &mut self,
        parallel: &Node,
        path: &mut Vec<NodeId>,
        members: &mut BTreeSet<NodeId>,
        depth: usize,
    ) -> Result<NodeId, String> {
        if depth > MAX_REGION_DEPTH {
            return Err(format!("parallel regions nest deeper than {MAX_REGION_DEPTH}"));
        }

        let mut seen_heads = HashSet::new();
        let mut closing: Vec<(NodeId, NodeId)> = Vec::new();
        let mut region_members = BTreeSet::new();
        let mut memo = Memo::new();
        for head in &parallel.outgoing {
            if !seen_heads.insert(head) {
                return Err(format!("branch {head} is listed twice"));
            }
            match self.walk(head, path, &mut region_members, &mut memo, depth)? {
                Some(join) => closing.push((head.clone(), join)),
                None => return Err(format!("branch {head} loops back without reaching a join")),
            }
        }

        let Some((_, first)) = closing.first() else {
            return Err("parallel node has no branches".to_string());
        };
        if let Some((head, other)) = closing.iter().find(|(_, j)| j != first) {
            return Err(format!(
                "branches close at different joins ({first} and {other} via {head})"
            ));
        }

        let join = first.clone();
        members.extend(region_members.iter().cloned());
        self.members.insert(parallel.id.clone(), region_members);
        Ok(join)
    }

    /// Follow one branch from `id`. `Ok(None)` means the walk looped back
    /// onto the current path.
    fn walk(
        &mut self,
        id: &NodeId,
        path: &mut Vec<NodeId>,
        members: &mut BTreeSet<NodeId>,
        memo: &mut Memo,
        depth: usize,
    ) -> Result<Option<NodeId>, String> {
        if path.contains(id) {
            return Ok(None);
        }
        if let Some(done) = memo.get(id) {
            return done.clone();
        }
        let result = self.walk_node(id, path, members, memo, depth);
        memo.insert(id.clone(), result.clone());
        result
    }

    fn walk_node(
        &mut self,
        id: &NodeId,
        path: &mut Vec<NodeId>,
        members: &mut BTreeSet<NodeId>,
        memo: &mut Memo,
        depth: usize,
    ) -> Result<Option<NodeId>, String> {
        let graph = self.graph;
        let node = graph
            .node(id)
            .ok_or_else(|| format!("branch reaches missing node {id}"))?;

        match &node.kind {
            NodeKind::Join => {
                self.touched_joins.insert(id.clone());
                Ok(Some(id.clone()))
            }
            NodeKind::End => Err(format!("branch reaches end node {id} before a join")),
            NodeKind::Start => Err(format!("branch reaches start node {id}")),
            NodeKind::Task { .. } => {
                let next = single_successor(node)?;
                members.insert(id.clone());
                path.push(id.clone());
                let result = self.walk(next, path, members, memo, depth);
                path.pop();
                result
            }
            NodeKind::Parallel => {
                path.push(id.clone());
                let result = self.walk_nested(node, path, members, memo, depth);
                path.pop();
                result
            }
            NodeKind::Condition { .. } => {
                members.insert(id.clone());
                path.push(id.clone());
                let mut closing: Option<NodeId> = None;
                let mut outcome = Ok(None);
                for arm in &node.outgoing {
                    match self.walk(arm, path, members, memo, depth) {
                        Ok(Some(join)) => match &closing {
                            Some(existing) if *existing != join => {
                                outcome = Err(format!(
                                    "condition {id} routes to different joins ({existing} and {join})"
                                ));
                                break;
                            }
                            _ => closing = Some(join),
                        },
                        Ok(None) => {}
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                path.pop();
                outcome.map(|_: Option<NodeId>| closing)
            }
        }
    }

    fn walk_nested(
        &mut self,
        parallel: &Node,
        path: &mut Vec<NodeId>,
        members: &mut BTreeSet<NodeId>,
        memo: &mut Memo,
        depth: usize,
    ) -> Result<Option<NodeId>, String> {
        let inner_join = self.trace_region(parallel, path, members, depth + 1)?;
        let graph = self.graph;
        let join_node = graph
            .node(&inner_join)
            .ok_or_else(|| format!("branch reaches missing node {inner_join}"))?;
        let next = single_successor(join_node)?;

        members.insert(parallel.id.clone());
        members.insert(inner_join.clone());
        path.push(inner_join);
        let result = self.walk(next, path, members, memo, depth);
        path.pop();
        result
    }
}

/// Finished branch walks of one region, by node.
type Memo = HashMap<NodeId, Result<Option<NodeId>, String>>;

fn single_successor(node: &Node) -> Result<&NodeId, String> {
    match node.outgoing.as_slice() {
        [next] => Ok(next),
        [] => Err(format!("branch stops at {} without reaching a join", node.id)),
        _ => Err(format!("branch forks at {} without a parallel node", node.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskTemplate;

    fn task(id: &str) -> Node {
        Node::task(id, TaskTemplate::default())
    }

    fn only_error(graph: WorkflowGraph) -> StructuralError {
        let result = graph.validate();
        assert_eq!(result.errors.len(), 1, "expected one error, got {:?}", result.errors);
        result.errors.into_iter().next().unwrap()
    }

    #[test]
    fn test_valid_sequential_graph() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("a"),
            task("a").to("b"),
            task("b").to("e"),
            Node::end("e"),
        ]);
        assert!(g.validate().is_valid());
    }

    #[test]
    fn test_valid_nested_parallel_with_condition() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("p1"),
            Node::parallel("p1").to("a").to("p2"),
            task("a").to("check"),
            Node::condition("check", "ok == true").to("j1").to("fix"),
            task("fix").to("check"),
            Node::parallel("p2").to("b").to("c"),
            task("b").to("j2"),
            task("c").to("j2"),
            Node::join("j2").to("j1"),
            Node::join("j1").to("e"),
            Node::end("e"),
        ]);
        let result = g.validate();
        assert!(result.is_valid(), "{:?}", result.errors);

        let regions = g.parallel_regions();
        assert_eq!(regions.get(&NodeId::from("p1")), Some(&NodeId::from("j1")));
        assert_eq!(regions.get(&NodeId::from("p2")), Some(&NodeId::from("j2")));
    }

    #[test]
    fn test_unreachable_node() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("a"),
            task("a").to("e"),
            task("orphan").to("e"),
            Node::end("e"),
        ]);
        assert_eq!(only_error(g), StructuralError::UnreachableNode("orphan".into()));
    }

    #[test]
    fn test_dangling_edge() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("c"),
            Node::condition("c", "go == true").to("e").to("ghost"),
            Node::end("e"),
        ]);
        assert_eq!(
            only_error(g),
            StructuralError::DanglingEdge {
                from: "c".into(),
                to: "ghost".into()
            }
        );
    }

    #[test]
    fn test_zero_and_multiple_starts() {
        let none = WorkflowGraph::new(vec![task("a").to("e"), Node::end("e")]);
        assert_eq!(only_error(none), StructuralError::NoStartNode);

        let two = WorkflowGraph::new(vec![
            Node::start("s1").to("e"),
            Node::start("s2").to("e"),
            Node::end("e"),
        ]);
        assert_eq!(
            only_error(two),
            StructuralError::MultipleStartNodes(vec!["s1".into(), "s2".into()])
        );
    }

    #[test]
    fn test_end_with_outgoing_edge() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("a"),
            task("a").to("e"),
            Node::end("e").to("a"),
        ]);
        assert_eq!(only_error(g), StructuralError::EndHasOutgoing("e".into()));
    }

    #[test]
    fn test_parallel_join_mismatch() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("p"),
            Node::parallel("p").to("a").to("b"),
            task("a").to("j1"),
            task("b").to("j2"),
            Node::join("j1").to("e"),
            Node::join("j2").to("e"),
            Node::end("e"),
        ]);
        assert!(matches!(
            only_error(g),
            StructuralError::ParallelJoinMismatch { parallel, .. } if parallel == NodeId::from("p")
        ));
    }

    #[test]
    fn test_branch_escaping_to_end() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("p"),
            Node::parallel("p").to("a").to("b"),
            task("a").to("j"),
            task("b").to("e"),
            Node::join("j").to("e"),
            Node::end("e"),
        ]);
        let errors = g.validate().errors;
        assert!(errors
            .iter()
            .any(|e| matches!(e, StructuralError::ParallelJoinMismatch { .. })));
    }

    #[test]
    fn test_join_fed_from_outside_region() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("c"),
            Node::condition("c", "fast == true").to("j").to("p"),
            Node::parallel("p").to("a").to("b"),
            task("a").to("j"),
            task("b").to("j"),
            Node::join("j").to("e"),
            Node::end("e"),
        ]);
        assert!(matches!(
            only_error(g),
            StructuralError::ParallelJoinMismatch { .. }
        ));
    }

    #[test]
    fn test_unmatched_join() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("j"),
            Node::join("j").to("e"),
            Node::end("e"),
        ]);
        assert_eq!(only_error(g), StructuralError::UnmatchedJoin("j".into()));
    }

    #[test]
    fn test_reports_every_problem() {
        let g = WorkflowGraph::new(vec![
            Node::start("s1").to("a"),
            Node::start("s2").to("a"),
            task("a").to("missing"),
            Node::end("e").to("a"),
        ]);
        let errors = g.validate().errors;
        assert!(errors.contains(&StructuralError::MultipleStartNodes(vec![
            "s1".into(),
            "s2".into()
        ])));
        assert!(errors.contains(&StructuralError::EndHasOutgoing("e".into())));
        assert!(errors.contains(&StructuralError::DanglingEdge {
            from: "a".into(),
            to: "missing".into()
        }));
    }

    #[test]
    fn test_condition_shape() {
        let g = WorkflowGraph::new(vec![
            Node::start("s").to("c"),
            Node::condition("c", "x ==").to("e"),
            Node::end("e"),
        ]);
        let errors = g.validate().errors;
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&StructuralError::ConditionArity {
            node: "c".into(),
            found: 1
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, StructuralError::InvalidCondition { .. })));
    }

    #[test]
    fn test_long_condition_chain_in_branch() {
        // Every condition can skip its task, so the number of distinct
        // paths through the branch doubles with each link.
        let links = 40;
        let mut nodes = vec![
            Node::start("s").to("fork"),
            Node::parallel("fork").to("c0").to("side"),
            task("side").to("join"),
        ];
        for i in 0..links {
            let next = if i + 1 == links {
                "join".to_string()
            } else {
                format!("c{}", i + 1)
            };
            nodes.push(
                Node::condition(format!("c{i}"), "ready == true")
                    .to(next.as_str())
                    .to(format!("t{i}")),
            );
            nodes.push(task(&format!("t{i}")).to(next.as_str()));
        }
        nodes.push(Node::join("join").to("e"));
        nodes.push(Node::end("e"));

        let g = WorkflowGraph::new(nodes);
        assert!(g.validate().is_valid());
        let regions = g.parallel_regions();
        assert_eq!(regions.get(&NodeId::from("fork")), Some(&NodeId::from("join")));
    }
}
