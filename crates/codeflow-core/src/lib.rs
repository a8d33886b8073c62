pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CodeflowError, Result};
pub use event::{EventBus, EventType, Notification};
pub use graph::{Node, NodeKind, TaskTemplate, WorkflowGraph};
pub use traits::{Entity, EventChannel, Repository};
pub use types::*;
