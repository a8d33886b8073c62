use thiserror::Error;

use crate::graph::StructuralError;
use crate::types::{AgentId, RunId, RunStatus, TaskId, TaskStatus, WorkflowId, WorkflowStatus};

#[derive(Debug, Error)]
pub enum CodeflowError {
    // Graph errors
    #[error("Workflow graph is malformed ({} problem(s)): {}", .0.len(), join_problems(.0))]
    Structural(Vec<StructuralError>),

    #[error("Condition on node {node} could not be evaluated: {message}")]
    ConditionEval { node: String, message: String },

    // State machine errors
    #[error("Illegal task transition for {task}: {from} -> {to}")]
    IllegalTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task} has incomplete dependencies: {}", join_ids(.pending))]
    DependenciesIncomplete { task: TaskId, pending: Vec<TaskId> },

    #[error("Task {0} needs an agent to become assigned; use assign")]
    AssignmentRequired(TaskId),

    // Assignment errors
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(AgentId),

    #[error("Task {task} is not queued (status: {status})")]
    TaskNotQueued { task: TaskId, status: TaskStatus },

    // Submission errors
    #[error("Workflow {workflow} is not active (status: {status})")]
    WorkflowNotActive {
        workflow: WorkflowId,
        status: WorkflowStatus,
    },

    #[error("Workflow {0} has no validated graph for its current version")]
    GraphInvalid(WorkflowId),

    #[error("Workflow {workflow} still has {active_runs} run(s) in flight")]
    WorkflowInUse {
        workflow: WorkflowId,
        active_runs: usize,
    },

    #[error("Run {run} is already {status}")]
    RunTerminal { run: RunId, status: RunStatus },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Event channel errors
    #[error("Event channel error: {0}")]
    Channel(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodeflowError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Lost races and busy agents: the caller may retry with a fresh read or
    /// another candidate.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AgentUnavailable(_) | Self::TaskNotQueued { .. })
    }
}

fn join_problems(problems: &[StructuralError]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, CodeflowError>;
