//! Workflow graph model: typed nodes with ordered adjacency lists.
//!
//! A workflow is a directed graph of `Node`s stored arena-style and indexed by
//! node id. Each node owns its outgoing edges as an ordered list of successor
//! ids. `Parallel` nodes fan out into branches that must all close at one
//! `Join`; `Condition` nodes route to `outgoing[0]` when their expression is
//! true and to `outgoing[1]` otherwise.

pub mod condition;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, AssignmentMethod, NodeId, TaskPriority};

pub use condition::{evaluate, Expr};
pub use validate::{StructuralError, ValidationResult};

/// Blueprint for the task a `Task` node instantiates on each visit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Defaults to the node label when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Overrides the engine's default assignment method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<AssignmentMethod>,
    /// Agent to use for manual assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Overrides the engine's auto-retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// A failed optional task never fails the run.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Node type, carrying the data only that type uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task {
        #[serde(default)]
        template: TaskTemplate,
    },
    Condition {
        expr: String,
    },
    Parallel,
    Join,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task { .. } => "task",
            Self::Condition { .. } => "condition",
            Self::Parallel => "parallel",
            Self::Join => "join",
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Successor node ids, in order.
    #[serde(default)]
    pub outgoing: Vec<NodeId>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.to_string(),
            id,
            kind,
            outgoing: Vec::new(),
        }
    }

    pub fn start(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn task(id: impl Into<NodeId>, template: TaskTemplate) -> Self {
        Self::new(id, NodeKind::Task { template })
    }

    pub fn condition(id: impl Into<NodeId>, expr: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Condition { expr: expr.into() })
    }

    pub fn parallel(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Parallel)
    }

    pub fn join(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Join)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Append a successor.
    pub fn to(mut self, next: impl Into<NodeId>) -> Self {
        self.outgoing.push(next.into());
        self
    }

    pub fn template(&self) -> Option<&TaskTemplate> {
        match &self.kind {
            NodeKind::Task { template } => Some(template),
            _ => None,
        }
    }
}

/// Arena of nodes indexed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphDocument", into = "GraphDocument")]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

/// Serialized form of a graph: just its node list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    nodes: Vec<Node>,
}

impl From<GraphDocument> for WorkflowGraph {
    fn from(doc: GraphDocument) -> Self {
        Self::new(doc.nodes)
    }
}

impl From<WorkflowGraph> for GraphDocument {
    fn from(graph: WorkflowGraph) -> Self {
        Self { nodes: graph.nodes }
    }
}

impl PartialEq for WorkflowGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl WorkflowGraph {
    /// Build a graph from its nodes. When ids repeat, lookups resolve to the
    /// first occurrence; validation reports the duplicate.
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.entry(node.id.clone()).or_insert(i);
        }
        Self { nodes, index }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// The single start node, if there is exactly one.
    pub fn start(&self) -> Option<&Node> {
        let mut starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start));
        match (starts.next(), starts.next()) {
            (Some(start), None) => Some(start),
            _ => None,
        }
    }

    /// Immediate successors of a node. Empty for `End` and unknown ids.
    pub fn next_nodes(&self, id: &NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.outgoing.as_slice()).unwrap_or(&[])
    }

    /// Nodes with an edge into `id`, in graph order.
    pub fn predecessors(&self, id: &NodeId) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.outgoing.contains(id))
            .map(|n| &n.id)
            .collect()
    }

    /// Pair every `Parallel` node with the `Join` that closes it. Parallels
    /// whose branches do not close at a single join are left out.
    pub fn parallel_regions(&self) -> BTreeMap<NodeId, NodeId> {
        let mut tracer = validate::RegionTracer::new(self);
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Parallel))
            .filter_map(|n| {
                tracer
                    .region_join(n)
                    .ok()
                    .map(|join| (n.id.clone(), join))
            })
            .collect()
    }

    /// The `Parallel` node whose branches close at `join`.
    pub fn parallel_for_join(&self, join: &NodeId) -> Option<NodeId> {
        self.parallel_regions()
            .into_iter()
            .find(|(_, j)| j == join)
            .map(|(p, _)| p)
    }

    /// True once every branch forked into `join` has arrived.
    ///
    /// Branches are identified by their head node, i.e. the successor of the
    /// `Parallel` node the branch started from. Arrival order is irrelevant.
    pub fn is_join_satisfied(&self, join: &NodeId, arrived: &BTreeSet<NodeId>) -> bool {
        let Some(parallel) = self.parallel_for_join(join) else {
            return false;
        };
        self.next_nodes(&parallel)
            .iter()
            .all(|branch| arrived.contains(branch))
    }

    /// Check the structural invariants and report every violation.
    pub fn validate(&self) -> ValidationResult {
        validate::validate(self)
    }
}
