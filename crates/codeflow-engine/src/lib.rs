//! Registries, agent assignment, the workflow run engine and the event
//! notifier.

pub mod assignment;
pub mod engine;
pub mod locks;
pub mod notifier;
pub mod registry;

pub use assignment::{select_agent, AssignmentPolicy, Candidate};
pub use engine::{Engine, FrontierEntry, FrontierSnapshot, PendingJoin};
pub use notifier::{InboundMessage, InboundRouter, Outbound};
pub use registry::{AgentRegistry, Registries, TaskReport, TaskRegistry, WorkflowRegistry};
