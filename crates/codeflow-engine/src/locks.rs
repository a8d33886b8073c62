//! Per-entity serialization.
//!
//! Every agent, task, workflow and run has its own async mutex, created on
//! first use. There is no global lock: operations on unrelated entities
//! never wait on each other. When an operation needs both an agent and a
//! task, it locks the agent first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use codeflow_core::types::{AgentId, TaskId, WorkflowId};

/// Table size above which idle entries are pruned on the next lock.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct EntityLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if table.len() > PRUNE_THRESHOLD {
                // Only the table holds an idle entry.
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            table.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    pub async fn agent(&self, id: &AgentId) -> OwnedMutexGuard<()> {
        self.lock(format!("agent:{id}")).await
    }

    pub async fn task(&self, id: &TaskId) -> OwnedMutexGuard<()> {
        self.lock(format!("task:{id}")).await
    }

    pub async fn workflow(&self, id: &WorkflowId) -> OwnedMutexGuard<()> {
        self.lock(format!("workflow:{id}")).await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }
}

/// Guards held together for one multi-entity operation.
#[derive(Default)]
pub struct HeldLocks {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl HeldLocks {
    pub fn push(&mut self, guard: OwnedMutexGuard<()>) {
        self.guards.push(guard);
    }
}
