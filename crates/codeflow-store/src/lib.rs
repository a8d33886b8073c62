mod memory;
mod sqlite;

use std::sync::Arc;

use codeflow_core::traits::Repository;
use codeflow_core::types::{Agent, Task, Workflow, WorkflowRun};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One repository per entity kind, as consumed by the registries and the
/// run engine.
#[derive(Clone)]
pub struct Stores {
    pub agents: Arc<dyn Repository<Agent>>,
    pub tasks: Arc<dyn Repository<Task>>,
    pub workflows: Arc<dyn Repository<Workflow>>,
    pub runs: Arc<dyn Repository<WorkflowRun>>,
}

impl Stores {
    /// Fresh in-memory repositories.
    pub fn memory() -> Self {
        Self {
            agents: Arc::new(MemoryStore::<Agent>::new()),
            tasks: Arc::new(MemoryStore::<Task>::new()),
            workflows: Arc::new(MemoryStore::<Workflow>::new()),
            runs: Arc::new(MemoryStore::<WorkflowRun>::new()),
        }
    }

    /// All entity kinds backed by one SQLite database.
    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            agents: store.clone(),
            tasks: store.clone(),
            workflows: store.clone(),
            runs: store,
        }
    }
}
